use std::sync::LazyLock;

use regex::Regex;
use reqwest::Url;
use tokio_util::sync::CancellationToken;

use super::decrypt::{parse_iv, HlsKey};
use crate::{
    error::{HozonError, HozonResult},
    fetch::SegmentFetcher,
};

const KEY_TAG: &str = "#EXT-X-KEY:";
const METHOD_NONE: &str = "NONE";
const METHOD_AES128: &str = "AES-128";

static ATTRIBUTE_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"([A-Z0-9-]+)=("[^"]*"|[^,]*)"#).unwrap());

/// Encryption declared by an `#EXT-X-KEY` tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyDeclaration {
    pub method: String,
    /// Key location, resolved against the playlist url.
    pub uri: Option<Url>,
    pub iv: Option<[u8; 16]>,
}

impl KeyDeclaration {
    fn parse(attributes: &str, base: &Url) -> HozonResult<Option<Self>> {
        let mut method = None;
        let mut uri = None;
        let mut iv = None;
        for captures in ATTRIBUTE_REGEX.captures_iter(attributes) {
            let value = captures[2].trim_matches('"');
            match &captures[1] {
                "METHOD" => method = Some(value.to_string()),
                "URI" => uri = Some(value.to_string()),
                "IV" => {
                    iv = parse_iv(value);
                    if iv.is_none() {
                        tracing::warn!("Ignored invalid IV {value}, fallback to segment index.");
                    }
                }
                _ => {}
            }
        }

        let Some(method) = method else {
            return Ok(None);
        };
        if method == METHOD_NONE {
            return Ok(None);
        }

        let uri = uri.map(|uri| base.join(&uri)).transpose()?;
        Ok(Some(Self { method, uri, iv }))
    }

    /// Fetch the key bytes and build the decryptor key.
    pub async fn load(
        &self,
        fetcher: &SegmentFetcher,
        cancel: &CancellationToken,
    ) -> HozonResult<HlsKey> {
        if self.method != METHOD_AES128 {
            return Err(HozonError::UnsupportedKeyMethod(self.method.clone()));
        }
        let uri = self
            .uri
            .as_ref()
            .ok_or_else(|| HozonError::KeyUriRequired(self.method.clone()))?;

        tracing::debug!("Fetching key from {uri}");
        let key = fetcher.fetch_bytes(uri, cancel).await?;
        HlsKey::from_bytes(&key, self.iv)
    }
}

/// Segments and encryption of a media playlist.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaManifest {
    pub segments: Vec<Url>,
    pub key: Option<KeyDeclaration>,
}

impl MediaManifest {
    /// Parse media playlist text. Relative segment and key uris are resolved against `base`.
    pub fn parse(text: &str, base: &Url) -> HozonResult<Self> {
        let mut key = None;
        for line in text.lines().map(str::trim) {
            if let Some(attributes) = line.strip_prefix(KEY_TAG) {
                key = KeyDeclaration::parse(attributes, base)?;
                break;
            }
        }

        let segments = text
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with('#'))
            .map(|line| base.join(line))
            .collect::<Result<Vec<_>, _>>()?;
        if segments.is_empty() {
            return Err(HozonError::NoSegments);
        }

        Ok(Self { segments, key })
    }

    /// Load the decryption key, if the playlist is encrypted.
    pub async fn load_key(
        &self,
        fetcher: &SegmentFetcher,
        cancel: &CancellationToken,
    ) -> HozonResult<Option<HlsKey>> {
        match &self.key {
            Some(key) => key.load(fetcher, cancel).await.map(Some),
            None => Ok(None),
        }
    }
}
