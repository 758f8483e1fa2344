use {
    super::errors::{RtmpError, RtmpErrorValue},
    url::Url,
};

pub const DEFAULT_PORT: u16 = 1935;

/// `rtmp://host[:port]/app[/...]/stream[?query]`. The last path segment is
/// the stream name; everything before it is the application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtmpAddress {
    pub host: String,
    pub port: u16,
    pub app: String,
    /// Stream name including any query string, as sent in `play`.
    pub stream: String,
    pub tc_url: String,
}

impl RtmpAddress {
    pub fn parse(raw: &str) -> Result<Self, RtmpError> {
        let url = Url::parse(raw).map_err(|err| RtmpErrorValue::BadUrl(format!("{raw}: {err}")))?;
        if url.scheme() != "rtmp" {
            return Err(RtmpErrorValue::BadUrl(format!("unsupported scheme {}", url.scheme())).into());
        }
        let host = url
            .host_str()
            .ok_or_else(|| RtmpErrorValue::BadUrl(format!("{raw}: missing host")))?
            .to_string();
        let port = url.port().unwrap_or(DEFAULT_PORT);

        let path = url.path().trim_matches('/');
        let (app, stream) = path
            .rsplit_once('/')
            .filter(|(app, stream)| !app.is_empty() && !stream.is_empty())
            .ok_or(RtmpErrorValue::NoStreamName)?;
        let stream = match url.query() {
            Some(query) => format!("{stream}?{query}"),
            None => stream.to_string(),
        };

        Ok(Self {
            tc_url: format!("rtmp://{host}:{port}/{app}"),
            host,
            port,
            app: app.to_string(),
            stream,
        })
    }
}

/// Splits `name?query` as received in `publish`/`play`.
#[must_use]
pub fn split_stream_name(raw: &str) -> (&str, Option<&str>) {
    match raw.split_once('?') {
        Some((name, query)) => (name, Some(query)),
        None => (raw, None),
    }
}
