use std::fmt;

use async_trait::async_trait;
use reqwest::header::{
    HeaderMap, HeaderName, HeaderValue, ACCEPT_RANGES, CONTENT_ENCODING, CONTENT_LENGTH,
    CONTENT_RANGE, RANGE,
};
use url::Url;

use super::BaseImage;
use crate::util::checked_range;
use crate::{DiskError, Result};

/// Remote base image read with HTTP `Range` requests.
///
/// The size is probed once at open time. Every read is a single ranged `GET`; failures are
/// returned to the caller without retrying.
pub struct HttpRangeImage {
    client: reqwest::Client,
    url: Url,
    request_headers: HeaderMap,
    total_size: u64,
}

impl fmt::Debug for HttpRangeImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let header_names: Vec<&str> = self.request_headers.keys().map(|k| k.as_str()).collect();
        f.debug_struct("HttpRangeImage")
            .field("url", &redact_url_for_logs(&self.url).as_str())
            .field("request_headers", &header_names)
            .field("total_size", &self.total_size)
            .finish()
    }
}

impl HttpRangeImage {
    /// `headers` are sent with every request (e.g. authorization); their values never appear in
    /// logs or `Debug` output.
    pub async fn open(url: Url, headers: &[(String, String)]) -> Result<Self> {
        let request_headers = build_header_map(headers)?;
        let client = reqwest::Client::new();
        let total_size = probe_remote_size(&client, &url, &request_headers).await?;
        tracing::debug!(
            url = %redact_url_for_logs(&url),
            total_size,
            "opened remote base image"
        );
        Ok(Self {
            client,
            url,
            request_headers,
            total_size,
        })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }
}

#[async_trait]
impl BaseImage for HttpRangeImage {
    fn capacity_bytes(&self) -> u64 {
        self.total_size
    }

    async fn read_at(&self, offset: u64, len: usize) -> Result<Vec<u8>> {
        checked_range(offset, len, self.total_size)?;
        if len == 0 {
            return Ok(Vec::new());
        }
        let end_inclusive = offset + len as u64 - 1;

        let resp = self
            .client
            .get(self.url.clone())
            .headers(self.request_headers.clone())
            .header(RANGE, format!("bytes={offset}-{end_inclusive}"))
            .send()
            .await?;

        if resp.status() != reqwest::StatusCode::PARTIAL_CONTENT {
            if resp.status().is_success() {
                return Err(DiskError::BaseUnavailable(
                    "server ignored the Range request".to_string(),
                ));
            }
            return Err(DiskError::HttpStatus {
                status: resp.status().as_u16(),
            });
        }

        if let Some(encoding) = resp
            .headers()
            .get(CONTENT_ENCODING)
            .and_then(|v| v.to_str().ok())
        {
            let encoding = encoding.trim();
            if !encoding.eq_ignore_ascii_case("identity") {
                return Err(DiskError::Http(format!(
                    "unexpected Content-Encoding: {encoding}"
                )));
            }
        }

        let content_range = resp
            .headers()
            .get(CONTENT_RANGE)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| DiskError::Http("missing Content-Range".to_string()))?;
        let (start, end, total) = parse_content_range(content_range)?;
        if start != offset || end != end_inclusive || total != self.total_size {
            return Err(DiskError::Http(format!(
                "unexpected Content-Range: {content_range} (expected bytes {offset}-{end_inclusive}/{})",
                self.total_size
            )));
        }

        let bytes = resp.bytes().await?;
        if bytes.len() != len {
            return Err(DiskError::Http(format!(
                "short range body: got {} bytes, expected {len}",
                bytes.len()
            )));
        }
        Ok(bytes.to_vec())
    }
}

impl From<reqwest::Error> for DiskError {
    fn from(value: reqwest::Error) -> Self {
        Self::Http(format_reqwest_error(value))
    }
}

async fn probe_remote_size(
    client: &reqwest::Client,
    url: &Url,
    request_headers: &HeaderMap,
) -> Result<u64> {
    let mut head_total_size: Option<u64> = None;

    let head = client
        .head(url.clone())
        .headers(request_headers.clone())
        .send()
        .await;
    if let Ok(resp) = head {
        if resp.status().is_success() {
            head_total_size = resp
                .headers()
                .get(CONTENT_LENGTH)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok());

            let accept_ranges = resp
                .headers()
                .get(ACCEPT_RANGES)
                .and_then(|v| v.to_str().ok())
                .map(|v| v.trim().to_ascii_lowercase());

            if accept_ranges.as_deref() == Some("bytes") {
                if let Some(len) = head_total_size {
                    return Ok(len);
                }
            }
        }
    }

    let resp = client
        .get(url.clone())
        .headers(request_headers.clone())
        .header(RANGE, "bytes=0-0")
        .send()
        .await?;

    if resp.status() != reqwest::StatusCode::PARTIAL_CONTENT {
        if resp.status().is_success() {
            return Err(DiskError::BaseUnavailable(
                "server does not support Range requests".to_string(),
            ));
        }
        return Err(DiskError::HttpStatus {
            status: resp.status().as_u16(),
        });
    }

    let cr = resp
        .headers()
        .get(CONTENT_RANGE)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| DiskError::Http("missing Content-Range".to_string()))?;
    let (_, _, total) = parse_content_range(cr)?;
    if let Some(expected) = head_total_size {
        if total != expected {
            return Err(DiskError::Http(format!(
                "Content-Range total ({total}) does not match Content-Length ({expected})"
            )));
        }
    }
    Ok(total)
}

fn build_header_map(headers: &[(String, String)]) -> Result<HeaderMap> {
    let mut out = HeaderMap::new();
    for (name, value) in headers {
        let name = HeaderName::from_bytes(name.to_ascii_lowercase().as_bytes())
            .map_err(|_| DiskError::InvalidConfig("invalid request header name"))?;
        let value = HeaderValue::from_str(value)
            .map_err(|_| DiskError::InvalidConfig("invalid request header value"))?;
        out.insert(name, value);
    }
    Ok(out)
}

fn redact_url_for_logs(url: &Url) -> Url {
    let mut url = url.clone();
    let _ = url.set_username("");
    let _ = url.set_password(None);
    url.set_query(None);
    url.set_fragment(None);
    url
}

fn format_reqwest_error(err: reqwest::Error) -> String {
    let mut msg = err.to_string();
    if let Some(url) = err.url() {
        let redacted = redact_url_for_logs(url);
        msg = msg.replace(url.as_str(), redacted.as_str());
    }
    msg
}

/// Parse `bytes <start>-<end>/<total>` into inclusive bounds plus total size.
fn parse_content_range(content_range: &str) -> Result<(u64, u64, u64)> {
    let invalid = || DiskError::Http(format!("invalid Content-Range: {content_range}"));

    let (unit, spec) = content_range
        .trim()
        .split_once(char::is_whitespace)
        .ok_or_else(invalid)?;
    if !unit.eq_ignore_ascii_case("bytes") {
        return Err(invalid());
    }
    let (range_part, total_part) = spec.trim().split_once('/').ok_or_else(invalid)?;
    let total: u64 = total_part.parse().map_err(|_| invalid())?;
    let (start_part, end_part) = range_part.split_once('-').ok_or_else(invalid)?;
    let start: u64 = start_part.parse().map_err(|_| invalid())?;
    let end: u64 = end_part.parse().map_err(|_| invalid())?;
    if end < start || end >= total {
        return Err(invalid());
    }
    Ok((start, end, total))
}
