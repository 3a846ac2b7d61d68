//! Raw HTTP/1.1 request writer and response reader.
//!
//! Headers are written exactly as the envelope carries them: same order,
//! same case, duplicates kept. Only the response head and a bounded prefix
//! of the response body are read back.

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};

use crate::error::ForwardError;
use crate::protocol::Envelope;
use crate::subscription::LocalEndpoint;

/// Headers never copied from the envelope. `Host` is rewritten.
const STRIPPED: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "trailers",
    "transfer-encoding",
    "upgrade",
    "host",
];

/// Upper bound on a response status line plus headers.
const MAX_HEAD_BYTES: u64 = 64 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body_prefix: Vec<u8>,
}

/// Serialize the request for `env` against `endpoint`.
pub fn encode_request(endpoint: &LocalEndpoint, env: &Envelope) -> Result<Vec<u8>, ForwardError> {
    if http::Method::from_bytes(env.method.as_bytes()).is_err() {
        return Err(ForwardError::Local(format!("invalid method '{}'", env.method)));
    }
    let target = endpoint.request_target(&env.path_suffix, &env.query_string);
    if target.bytes().any(|b| b <= b' ' || b == 0x7f) {
        return Err(ForwardError::Local(format!("invalid request target '{target}'")));
    }

    let mut declared_length = None;
    for (name, value) in &env.headers {
        if http::HeaderName::from_bytes(name.as_bytes()).is_err() {
            return Err(ForwardError::Local(format!("invalid header name '{name}'")));
        }
        if http::HeaderValue::from_bytes(value.as_bytes()).is_err() {
            return Err(ForwardError::Local(format!("invalid value for header '{name}'")));
        }
        if name.eq_ignore_ascii_case("content-length") {
            let len: usize = value
                .trim()
                .parse()
                .map_err(|_| ForwardError::Local(format!("invalid content-length '{value}'")))?;
            if len != env.body.len() || declared_length.is_some_and(|d| d != len) {
                return Err(ForwardError::Local(format!(
                    "content-length {len} does not match body of {} bytes",
                    env.body.len()
                )));
            }
            declared_length = Some(len);
        }
    }

    let mut out = Vec::with_capacity(256 + env.body.len());
    out.extend_from_slice(env.method.as_bytes());
    out.push(b' ');
    out.extend_from_slice(target.as_bytes());
    out.extend_from_slice(b" HTTP/1.1\r\nHost: ");
    out.extend_from_slice(endpoint.authority().as_bytes());
    out.extend_from_slice(b"\r\n");
    for (name, value) in &env.headers {
        if STRIPPED.iter().any(|s| name.eq_ignore_ascii_case(s)) {
            continue;
        }
        out.extend_from_slice(name.as_bytes());
        out.extend_from_slice(b": ");
        out.extend_from_slice(value.as_bytes());
        out.extend_from_slice(b"\r\n");
    }
    if declared_length.is_none() {
        out.extend_from_slice(format!("Content-Length: {}\r\n", env.body.len()).as_bytes());
    }
    out.extend_from_slice(b"\r\n");
    out.extend_from_slice(&env.body);
    Ok(out)
}

/// Write `request` and read the final response.
pub async fn exchange<S>(
    mut io: S,
    request: &[u8],
    head_request: bool,
    body_limit: usize,
) -> Result<Response, ForwardError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    io.write_all(request).await.map_err(io_error("write request"))?;
    io.flush().await.map_err(io_error("write request"))?;
    read_response(io, head_request, body_limit).await
}

/// Read one response, skipping interim `1xx` heads.
pub async fn read_response<R>(io: R, head_request: bool, body_limit: usize) -> Result<Response, ForwardError>
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(io);
    loop {
        let (status, headers) = read_head(&mut reader).await?;
        if (100..200).contains(&status) && status != 101 {
            continue;
        }
        let bodyless = head_request || status == 204 || status == 304 || status < 200;
        let body_prefix = if bodyless {
            Vec::new()
        } else {
            read_body(&mut reader, &headers, body_limit).await?
        };
        return Ok(Response {
            status,
            headers,
            body_prefix,
        });
    }
}

async fn read_head<R>(reader: &mut R) -> Result<(u16, Vec<(String, String)>), ForwardError>
where
    R: AsyncBufRead + Unpin,
{
    let mut limited = reader.take(MAX_HEAD_BYTES);
    let mut line = Vec::new();

    if limited.read_until(b'\n', &mut line).await.map_err(io_error("read response"))? == 0 {
        return Err(ForwardError::Local("connection closed before response".into()));
    }
    let status = parse_status_line(&line)?;

    let mut headers: Vec<(String, String)> = Vec::new();
    loop {
        line.clear();
        if limited.read_until(b'\n', &mut line).await.map_err(io_error("read response"))? == 0 {
            return Err(if limited.limit() == 0 {
                ForwardError::Local("response head too large".into())
            } else {
                ForwardError::Local("connection closed inside response head".into())
            });
        }
        let text = String::from_utf8_lossy(trim_eol(&line)).into_owned();
        if text.is_empty() {
            return Ok((status, headers));
        }
        if text.starts_with([' ', '\t']) {
            // obs-fold continuation
            if let Some((_, value)) = headers.last_mut() {
                value.push(' ');
                value.push_str(text.trim());
            }
            continue;
        }
        let (name, value) = text
            .split_once(':')
            .ok_or_else(|| ForwardError::Local(format!("malformed response header '{text}'")))?;
        headers.push((name.trim().to_string(), value.trim().to_string()));
    }
}

fn parse_status_line(line: &[u8]) -> Result<u16, ForwardError> {
    let text = String::from_utf8_lossy(trim_eol(line));
    let mut parts = text.splitn(3, ' ');
    let version = parts.next().unwrap_or_default();
    let code = parts.next().unwrap_or_default();
    if !version.starts_with("HTTP/1.") {
        return Err(ForwardError::Local(format!("malformed status line '{text}'")));
    }
    code.parse::<u16>()
        .ok()
        .filter(|c| (100..1000).contains(c))
        .ok_or_else(|| ForwardError::Local(format!("malformed status line '{text}'")))
}

async fn read_body<R>(
    reader: &mut R,
    headers: &[(String, String)],
    limit: usize,
) -> Result<Vec<u8>, ForwardError>
where
    R: AsyncBufRead + Unpin,
{
    let chunked = header(headers, "transfer-encoding")
        .and_then(|v| v.rsplit(',').next())
        .is_some_and(|last| last.trim().eq_ignore_ascii_case("chunked"));
    if chunked {
        return read_chunked(reader, limit).await;
    }

    let to_read = match header(headers, "content-length") {
        Some(v) => {
            let len: u64 = v
                .trim()
                .parse()
                .map_err(|_| ForwardError::Local(format!("invalid response content-length '{v}'")))?;
            len.min(limit as u64)
        }
        None => limit as u64,
    };
    let mut body = Vec::new();
    reader
        .take(to_read)
        .read_to_end(&mut body)
        .await
        .map_err(io_error("read response body"))?;
    Ok(body)
}

async fn read_chunked<R>(reader: &mut R, limit: usize) -> Result<Vec<u8>, ForwardError>
where
    R: AsyncBufRead + Unpin,
{
    let mut body = Vec::new();
    let mut line = Vec::new();
    while body.len() < limit {
        line.clear();
        if reader.read_until(b'\n', &mut line).await.map_err(io_error("read chunk"))? == 0 {
            break;
        }
        let text = String::from_utf8_lossy(trim_eol(&line));
        let size_text = text.split(';').next().unwrap_or_default().trim();
        let size = u64::from_str_radix(size_text, 16)
            .map_err(|_| ForwardError::Local(format!("malformed chunk size '{size_text}'")))?;
        if size == 0 {
            break;
        }
        let wanted = size.min((limit - body.len()) as u64);
        let before = body.len();
        (&mut *reader)
            .take(wanted)
            .read_to_end(&mut body)
            .await
            .map_err(io_error("read chunk"))?;
        if ((body.len() - before) as u64) < size {
            // Either the limit was reached or the peer closed mid-chunk.
            break;
        }
        line.clear();
        reader.read_until(b'\n', &mut line).await.map_err(io_error("read chunk"))?;
    }
    Ok(body)
}

fn header<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(n, _)| n.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

fn trim_eol(line: &[u8]) -> &[u8] {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    line.strip_suffix(b"\r").unwrap_or(line)
}

fn io_error(context: &'static str) -> impl Fn(std::io::Error) -> ForwardError {
    move |e| ForwardError::Local(format!("{context}: {e}"))
}
