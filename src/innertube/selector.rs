use super::profiles::{profile_by_id, ClientProfile};
use crate::structs::InnertubeOptions;
use crate::VideoError;

const UNAUTHENTICATED_DEFAULTS: &[&str] = &["android_vr", "web", "web_safari"];
const AUTHENTICATED_DEFAULTS: &[&str] = &["tv_downgraded", "web", "web_safari"];
const FALLBACK_CLIENTS: &[&str] = &["web_embedded", "tv"];

/// Ordered client plan for one extraction, split into the primary race
/// and the fallback phase.
#[derive(Debug, Clone)]
pub(crate) struct ClientPlan {
    pub primary: Vec<&'static ClientProfile>,
    pub fallback: Vec<&'static ClientProfile>,
}

/// Resolve the ordered client list from overrides or defaults, apply the
/// skip list, and append the fallback phase where policy allows it.
pub(crate) fn select_clients(
    options: &InnertubeOptions,
    authenticated: bool,
) -> Result<ClientPlan, VideoError> {
    let (primary_ids, overridden): (Vec<String>, bool) = match &options.client_overrides {
        Some(ids) => (ids.clone(), true),
        None => {
            let defaults = if authenticated {
                AUTHENTICATED_DEFAULTS
            } else {
                UNAUTHENTICATED_DEFAULTS
            };
            (defaults.iter().map(|id| id.to_string()).collect(), false)
        }
    };

    let mut primary = Vec::new();
    for id in &primary_ids {
        let profile = profile_by_id(id).ok_or_else(|| VideoError::UnknownClient(id.clone()))?;
        if options.client_skip.iter().any(|skip| skip == id) {
            continue;
        }
        primary.push(profile);
    }

    let append_fallback = !options.disable_fallback_clients
        && (!overridden || options.append_fallback_on_client_overrides);

    let mut fallback = Vec::new();
    if append_fallback {
        for id in FALLBACK_CLIENTS {
            if options.client_skip.iter().any(|skip| skip == id) {
                continue;
            }
            if primary.iter().any(|profile| profile.id == *id) {
                continue;
            }
            // Unwrap is fine, the fallback table names registry entries.
            fallback.push(profile_by_id(id).expect("registered fallback client"));
        }
    }

    Ok(ClientPlan { primary, fallback })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(profiles: &[&'static ClientProfile]) -> Vec<&'static str> {
        profiles.iter().map(|profile| profile.id).collect()
    }

    #[test]
    fn default_plans() {
        let plan = select_clients(&InnertubeOptions::default(), false).unwrap();
        assert_eq!(ids(&plan.primary), vec!["android_vr", "web", "web_safari"]);
        assert_eq!(ids(&plan.fallback), vec!["web_embedded", "tv"]);

        let plan = select_clients(&InnertubeOptions::default(), true).unwrap();
        assert_eq!(
            ids(&plan.primary),
            vec!["tv_downgraded", "web", "web_safari"]
        );
    }

    #[test]
    fn overrides_replace_defaults_without_fallback() {
        let options = InnertubeOptions {
            client_overrides: Some(vec!["ios".into(), "web".into()]),
            ..Default::default()
        };
        let plan = select_clients(&options, false).unwrap();
        assert_eq!(ids(&plan.primary), vec!["ios", "web"]);
        assert!(plan.fallback.is_empty());
    }

    #[test]
    fn overrides_with_fallback_appended() {
        let options = InnertubeOptions {
            client_overrides: Some(vec!["tv".into()]),
            append_fallback_on_client_overrides: true,
            ..Default::default()
        };
        let plan = select_clients(&options, false).unwrap();
        assert_eq!(ids(&plan.primary), vec!["tv"]);
        // Clients already in the primary phase are not raced twice.
        assert_eq!(ids(&plan.fallback), vec!["web_embedded"]);
    }

    #[test]
    fn skip_filters_both_phases() {
        let options = InnertubeOptions {
            client_skip: vec!["web".into(), "tv".into()],
            ..Default::default()
        };
        let plan = select_clients(&options, false).unwrap();
        assert_eq!(ids(&plan.primary), vec!["android_vr", "web_safari"]);
        assert_eq!(ids(&plan.fallback), vec!["web_embedded"]);
    }

    #[test]
    fn unknown_override_is_an_error() {
        let options = InnertubeOptions {
            client_overrides: Some(vec!["betamax".into()]),
            ..Default::default()
        };
        assert!(matches!(
            select_clients(&options, false),
            Err(VideoError::UnknownClient(id)) if id == "betamax"
        ));
    }
}
