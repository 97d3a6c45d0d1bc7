use std::collections::HashMap;

use aes::cipher::block_padding::Pkcs7;
use aes::cipher::{BlockDecryptMut, KeyIvInit};
use m3u8_rs::Key;
use url::Url;

use crate::utils::make_absolute_url;
use crate::VideoError;

type Aes128CbcDec = cbc::Decryptor<aes::Aes128>;

/// Fetched AES keys by URI, so one key serves every segment it covers.
#[derive(Default)]
pub(crate) struct KeyCache {
    keys: tokio::sync::Mutex<HashMap<Url, [u8; 16]>>,
}

impl KeyCache {
    async fn key_for(
        &self,
        client: &reqwest::Client,
        uri: &Url,
    ) -> Result<[u8; 16], VideoError> {
        {
            let keys = self.keys.lock().await;
            if let Some(key) = keys.get(uri) {
                return Ok(*key);
            }
        }

        let body = client
            .get(uri.clone())
            .send()
            .await
            .map_err(VideoError::Reqwest)?
            .bytes()
            .await
            .map_err(VideoError::Reqwest)?;

        if body.len() < 16 {
            return Err(VideoError::EncryptionError(format!(
                "key at {uri} is {} bytes, expected 16",
                body.len()
            )));
        }

        let mut key = [0_u8; 16];
        key.copy_from_slice(&body[..16]);

        let mut keys = self.keys.lock().await;
        keys.insert(uri.clone(), key);
        Ok(key)
    }
}

/// HLS segment encryption, resolved from `#EXT-X-KEY`.
#[derive(Clone, Debug, Default)]
pub(crate) enum SegmentEncryption {
    #[default]
    None,
    Aes128 {
        key_uri: Url,
        iv: [u8; 16],
    },
}

impl SegmentEncryption {
    /// Resolve a playlist key line. The IV falls back to the segment
    /// sequence number when the playlist does not carry one.
    pub fn from_key(m3u8_key: &Key, base_url: &str, seq: u64) -> Result<Self, VideoError> {
        match &m3u8_key {
            k if k.method.to_string() == *"NONE" => Ok(Self::None),
            k if k.method.to_string() == *"AES-128" => {
                let uri = k.uri.as_ref().ok_or_else(|| {
                    VideoError::EncryptionError("No URI found for AES-128 key".to_string())
                })?;

                if let Some(keyformat) = &k.keyformat {
                    if keyformat != "identity" {
                        return Err(VideoError::EncryptionError(format!(
                            "Invalid keyformat: {keyformat}"
                        )));
                    }
                }

                let uri = make_absolute_url(base_url, uri)?;

                let mut iv = [0_u8; 16];
                if let Some(iv_str) = &k.iv {
                    let iv_str = iv_str.trim_start_matches("0x");
                    hex::decode_to_slice(iv_str, &mut iv as &mut [u8])
                        .map_err(VideoError::HexError)?;
                } else {
                    iv[(16 - std::mem::size_of_val(&seq))..].copy_from_slice(&seq.to_be_bytes());
                }

                Ok(Self::Aes128 { key_uri: uri, iv })
            }
            k if k.method.to_string() == *"SAMPLE-AES" => Err(VideoError::EncryptionError(
                format!("Unimplemented encryption method: {}", k.method),
            )),
            k => Err(VideoError::EncryptionError(format!(
                "Invalid encryption method: {}",
                k.method
            ))),
        }
    }

    /// Decrypt one segment, fetching the key on demand. Ciphertext that is
    /// not block aligned is rejected instead of silently truncated.
    pub async fn decrypt(
        &self,
        client: &reqwest::Client,
        keys: &KeyCache,
        data: &[u8],
    ) -> Result<Vec<u8>, VideoError> {
        match self {
            Self::None => Ok(Vec::from(data)),
            Self::Aes128 { key_uri, iv } => {
                if data.len() % 16 != 0 {
                    return Err(VideoError::DecryptionError(format!(
                        "ciphertext length {} not AES block aligned",
                        data.len()
                    )));
                }

                let key = keys.key_for(client, key_uri).await?;
                Aes128CbcDec::new(&key.into(), iv.into())
                    .decrypt_padded_vec_mut::<Pkcs7>(data)
                    .map_err(|e| VideoError::DecryptionError(e.to_string()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key_from_playlist(key_line: &str) -> Key {
        let body = format!(
            "#EXTM3U\n#EXT-X-TARGETDURATION:1\n{key_line}\n#EXTINF:1.0,\nseg.ts\n"
        );
        let playlist = m3u8_rs::parse_media_playlist(body.as_bytes()).unwrap().1;
        playlist.segments[0].key.clone().expect("key line parsed")
    }

    #[test]
    fn sequence_number_becomes_iv() {
        let key = key_from_playlist(r#"#EXT-X-KEY:METHOD=AES-128,URI="key.bin""#);
        let parsed =
            SegmentEncryption::from_key(&key, "https://example.com/playlist.m3u8", 7).unwrap();

        match parsed {
            SegmentEncryption::Aes128 { iv, key_uri } => {
                assert_eq!(iv[15], 7);
                assert_eq!(iv[..15], [0u8; 15]);
                assert_eq!(key_uri.as_str(), "https://example.com/key.bin");
            }
            SegmentEncryption::None => panic!("expected aes"),
        }
    }

    #[test]
    fn explicit_iv_is_parsed() {
        let key = key_from_playlist(
            r#"#EXT-X-KEY:METHOD=AES-128,URI="https://example.com/key.bin",IV=0x000102030405060708090a0b0c0d0e0f"#,
        );
        let parsed =
            SegmentEncryption::from_key(&key, "https://example.com/playlist.m3u8", 0).unwrap();

        match parsed {
            SegmentEncryption::Aes128 { iv, .. } => {
                assert_eq!(iv[1], 1);
                assert_eq!(iv[15], 15);
            }
            SegmentEncryption::None => panic!("expected aes"),
        }
    }

    #[test]
    fn sample_aes_is_rejected() {
        let key = key_from_playlist(r#"#EXT-X-KEY:METHOD=SAMPLE-AES,URI="key.bin""#);
        assert!(matches!(
            SegmentEncryption::from_key(&key, "https://example.com/playlist.m3u8", 0),
            Err(VideoError::EncryptionError(_))
        ));
    }

    #[tokio::test]
    async fn unaligned_ciphertext_is_rejected() {
        let encryption = SegmentEncryption::Aes128 {
            key_uri: Url::parse("https://example.com/key.bin").unwrap(),
            iv: [0u8; 16],
        };
        let client = reqwest::Client::new();
        let keys = KeyCache::default();

        assert!(matches!(
            encryption.decrypt(&client, &keys, &[0u8; 15]).await,
            Err(VideoError::DecryptionError(_))
        ));
    }
}
