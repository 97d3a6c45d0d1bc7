use std::path::PathBuf;
use std::sync::Arc;

/// Stage of the extraction pipeline an event belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::Display)]
pub enum ExtractionStage {
    #[display("webpage")]
    Webpage,
    #[display("player_api_json")]
    PlayerApiJson,
    #[display("player_js")]
    PlayerJs,
    #[display("challenge")]
    Challenge,
    #[display("manifest")]
    Manifest,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::Display)]
pub enum EventPhase {
    #[display("start")]
    Start,
    #[display("success")]
    Success,
    #[display("failure")]
    Failure,
    #[display("partial")]
    Partial,
}

#[derive(Debug, Clone)]
pub struct ExtractionEvent {
    pub stage: ExtractionStage,
    pub phase: EventPhase,
    pub client: Option<String>,
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::Display)]
pub enum DownloadStage {
    #[display("download")]
    Download,
    #[display("merge")]
    Merge,
    #[display("cleanup")]
    Cleanup,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::Display)]
pub enum DownloadPhase {
    #[display("destination")]
    Destination,
    #[display("start")]
    Start,
    #[display("complete")]
    Complete,
    #[display("failure")]
    Failure,
    #[display("skip")]
    Skip,
    #[display("delete")]
    Delete,
}

#[derive(Debug, Clone)]
pub struct DownloadEvent {
    pub stage: DownloadStage,
    pub phase: DownloadPhase,
    pub video_id: String,
    pub path: Option<PathBuf>,
    pub detail: Option<String>,
}

pub type ExtractionHook = Arc<dyn Fn(&ExtractionEvent) + Send + Sync + 'static>;
pub type DownloadHook = Arc<dyn Fn(&DownloadEvent) + Send + Sync + 'static>;

/// Cheap clonable fan-out point for lifecycle events. A sink without hooks
/// still logs through the `log` facade.
#[derive(Clone, Default)]
pub(crate) struct EventSink {
    pub(crate) on_extraction: Option<ExtractionHook>,
    pub(crate) on_download: Option<DownloadHook>,
}

impl EventSink {
    pub(crate) fn extraction(
        &self,
        stage: ExtractionStage,
        phase: EventPhase,
        client: Option<&str>,
        detail: Option<String>,
    ) {
        log::debug!(
            "extraction {stage}/{phase} client={} detail={}",
            client.unwrap_or("-"),
            detail.as_deref().unwrap_or("-")
        );
        if let Some(hook) = &self.on_extraction {
            hook(&ExtractionEvent {
                stage,
                phase,
                client: client.map(str::to_string),
                detail,
            });
        }
    }

    pub(crate) fn download(
        &self,
        stage: DownloadStage,
        phase: DownloadPhase,
        video_id: &str,
        path: Option<PathBuf>,
        detail: Option<String>,
    ) {
        log::debug!(
            "download {stage}/{phase} video={video_id} path={:?} detail={}",
            path,
            detail.as_deref().unwrap_or("-")
        );
        if let Some(hook) = &self.on_download {
            hook(&DownloadEvent {
                stage,
                phase,
                video_id: video_id.to_string(),
                path,
                detail,
            });
        }
    }
}
