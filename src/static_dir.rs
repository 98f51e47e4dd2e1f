//! Static directory application.
//!
//! Serves files below a root directory. A directory is answered with its
//! index file when it has one and with a generated listing otherwise.
//! Executable files inside the CGI directory are run as scripts and their
//! output is streamed back. Requests for other hosts, ports or schemes are
//! refused as proxy requests.

use std::fs::{self, File, Metadata};
use std::io::{self, BufRead, BufReader, Read};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use tracing::{debug, warn};
use url::{Host, Url};

use crate::app::{producer, AppError, Application, Chunk, Producer, Response, StatusSender};
use crate::protocols::gemini::{RequestContext, ServerInfo};
use crate::status::Status;

/// Files and script output are streamed in chunks of this size.
pub const CHUNK_SIZE: usize = 1024;

const NOT_FOUND: &str = "Not Found";
const PROXY_REFUSED: &str = "This server does not allow proxy requests";
const UNRECOGNIZED_URL: &str = "Unrecognized URL format";
const CGI_FAILED: &str = "Unexpected Error";

/// Serves a directory tree over Gemini.
#[derive(Debug, Clone)]
pub struct StaticDirectoryApp {
    root: PathBuf,
    index_file: String,
    cgi_directory: String,
}

impl StaticDirectoryApp {
    /// `root` must exist. `cgi_directory` is relative to it.
    pub fn new(
        root: impl AsRef<Path>,
        index_file: impl Into<String>,
        cgi_directory: &str,
    ) -> io::Result<Self> {
        Ok(Self {
            root: root.as_ref().canonicalize()?,
            index_file: index_file.into(),
            cgi_directory: format!("{}/", cgi_directory.trim_matches('/')),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn respond(&self, ctx: &RequestContext) -> Result<Response, AppError> {
        let Some(url) = parse_request_url(ctx.url()) else {
            return Ok(Response::new(Status::BAD_REQUEST, UNRECOGNIZED_URL));
        };
        if !is_local(&url, ctx.server()) {
            debug!(url = %ctx.url(), "Refusing proxy request");
            return Ok(Response::new(Status::PROXY_REQUEST_REFUSED, PROXY_REFUSED));
        }
        self.serve_path(ctx)
    }

    fn serve_path(&self, ctx: &RequestContext) -> Result<Response, AppError> {
        let Some(relative) = normalize(ctx.path().trim_matches('/')) else {
            return Ok(not_found());
        };
        let path = self.root.join(&relative);
        let Ok(metadata) = fs::metadata(&path) else {
            return Ok(not_found());
        };

        if metadata.is_file() {
            if relative.starts_with(&self.cgi_directory) && is_executable(&metadata) {
                return self.run_cgi(&path, ctx);
            }
            let Ok(file) = File::open(&path) else {
                return Ok(not_found());
            };
            return Ok(Response::new(Status::SUCCESS, guess_mimetype(&path))
                .with_producer(Box::new(ReadProducer::new(file))));
        }

        if metadata.is_dir() {
            if !ctx.path().ends_with('/') {
                return Ok(Response::new(
                    Status::REDIRECT_PERMANENT,
                    with_trailing_slash(ctx.url()),
                ));
            }

            let index = path.join(&self.index_file);
            if index.exists() {
                let file = File::open(&index)?;
                return Ok(Response::new(Status::SUCCESS, "text/gemini")
                    .with_producer(Box::new(ReadProducer::new(file))));
            }

            let Ok(listing) = list_directory(&relative, &path) else {
                return Ok(not_found());
            };
            return Ok(Response::new(Status::SUCCESS, "text/gemini")
                .with_producer(producer::from_iter(listing)));
        }

        Ok(not_found())
    }

    /// Run `script` with the request context as its environment. The first
    /// line of output is the status line, the rest is the body.
    fn run_cgi(&self, script: &Path, ctx: &RequestContext) -> Result<Response, AppError> {
        debug!(script = %script.display(), "Running CGI script");
        let mut child = Command::new(script)
            .env_clear()
            .envs(ctx.vars())
            .env("GATEWAY_INTERFACE", "GCI/1.1")
            .env("SCRIPT_NAME", script)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .spawn()?;

        let stdout = child.stdout.take().ok_or("CGI stdout was not captured")?;
        let mut reader = BufReader::new(stdout);
        let mut line = Vec::new();
        reader.read_until(b'\n', &mut line)?;

        match parse_cgi_status(&line) {
            Some((status, meta)) => Ok(Response::new(status, meta).with_producer(Box::new(
                ReadProducer {
                    reader,
                    child: Some(child),
                },
            ))),
            None => {
                warn!(
                    script = %script.display(),
                    line = %String::from_utf8_lossy(&line).trim_end(),
                    "Invalid CGI status line"
                );
                let _ = child.kill();
                let _ = child.wait();
                Ok(Response::new(Status::CGI_ERROR, CGI_FAILED))
            }
        }
    }
}

impl Application for StaticDirectoryApp {
    fn call(
        &self,
        context: RequestContext,
        status: StatusSender,
    ) -> Result<Box<dyn Producer>, AppError> {
        Ok(self.respond(&context)?.into_producer(status))
    }
}

fn not_found() -> Response {
    Response::new(Status::NOT_FOUND, NOT_FOUND)
}

/// Parse the request URL. A URL without a scheme (`//host/path`) is taken
/// to be a gemini URL. A host is required.
fn parse_request_url(raw: &str) -> Option<Url> {
    let parsed = if raw.starts_with("//") {
        Url::parse(&format!("gemini:{raw}"))
    } else {
        Url::parse(raw)
    };
    parsed.ok().filter(|url| url.host().is_some())
}

/// Whether the URL names this server rather than asking it to proxy.
fn is_local(url: &Url, server: &ServerInfo) -> bool {
    let host = match url.host() {
        Some(Host::Domain(domain)) => domain.to_string(),
        Some(Host::Ipv4(addr)) => addr.to_string(),
        Some(Host::Ipv6(addr)) => addr.to_string(),
        None => return false,
    };

    url.scheme() == "gemini"
        && host.eq_ignore_ascii_case(&server.hostname)
        && url.port().map_or(true, |port| port == server.port)
}

/// Collapse `.` and `..` segments of a root-relative path. Returns `None`
/// for paths that would leave the root.
fn normalize(path: &str) -> Option<String> {
    let mut parts = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                parts.pop()?;
            }
            segment => parts.push(segment),
        }
    }

    if parts.last().is_some_and(|name| name.starts_with("..")) {
        return None;
    }
    Some(parts.join("/"))
}

/// Append `/` to the path of a raw URL, keeping the query and fragment.
fn with_trailing_slash(url: &str) -> String {
    let authority_end = url.find("//").map_or(0, |i| i + 2);
    let end = url[authority_end..]
        .find(['?', '#'])
        .map_or(url.len(), |i| authority_end + i);
    format!("{}/{}", &url[..end], &url[end..])
}

fn guess_mimetype(path: &Path) -> String {
    match path.extension().and_then(|ext| ext.to_str()) {
        Some("gmi" | "gemini") => "text/gemini".to_string(),
        _ => mime_guess::from_path(path)
            .first()
            .map(|mime| mime.to_string())
            .unwrap_or_else(|| "text/plain".to_string()),
    }
}

#[cfg(unix)]
fn is_executable(metadata: &Metadata) -> bool {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode() & 0o111 != 0
}

#[cfg(not(unix))]
fn is_executable(_metadata: &Metadata) -> bool {
    false
}

/// Build a text/gemini listing of `dir`, whose root-relative path is
/// `relative`. Hidden entries are skipped.
fn list_directory(relative: &str, dir: &Path) -> io::Result<Vec<String>> {
    let mut names = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.starts_with('.') {
            continue;
        }
        let is_dir = entry.file_type()?.is_dir();
        names.push((name, is_dir));
    }
    names.sort();

    let link = |name: &str| {
        if relative.is_empty() {
            format!("/{name}")
        } else {
            format!("/{relative}/{name}")
        }
    };

    let mut lines = vec![format!("Directory: /{relative}\r\n")];
    if !relative.is_empty() {
        let parent = relative.rsplit_once('/').map_or("", |(parent, _)| parent);
        lines.push(format!("=>/{parent}\t..\r\n"));
    }
    for (name, is_dir) in names {
        if is_dir {
            lines.push(format!("=>{}/\t{name}/\r\n", link(&name)));
        } else {
            lines.push(format!("=>{}\t{name}\r\n", link(&name)));
        }
    }
    Ok(lines)
}

/// Parse a CGI status line: a decimal code, whitespace, then the meta.
fn parse_cgi_status(line: &[u8]) -> Option<(Status, String)> {
    let line = String::from_utf8_lossy(line);
    let (code, meta) = line.trim().split_once(char::is_whitespace)?;
    let meta = meta.trim_start();
    if meta.is_empty() || !code.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let code = code.parse::<u8>().ok()?;
    Some((Status::from_code(code), meta.to_string()))
}

/// Streams a file or a CGI script's stdout in fixed-size chunks. A child
/// process is reaped once its output is exhausted, or killed if the
/// response is abandoned early.
struct ReadProducer<R> {
    reader: R,
    child: Option<Child>,
}

impl<R> ReadProducer<R> {
    fn new(reader: R) -> Self {
        Self {
            reader,
            child: None,
        }
    }
}

impl<R: Read + Send> Producer for ReadProducer<R> {
    fn next_chunk(&mut self) -> Result<Option<Chunk>, AppError> {
        let mut buf = vec![0; CHUNK_SIZE];
        let n = self.reader.read(&mut buf)?;
        if n == 0 {
            if let Some(mut child) = self.child.take() {
                let status = child.wait()?;
                debug!(%status, "CGI script exited");
            }
            return Ok(None);
        }
        buf.truncate(n);
        Ok(Some(Chunk::from(buf)))
    }
}

impl<R> Drop for ReadProducer<R> {
    fn drop(&mut self) {
        if let Some(child) = self.child.as_mut() {
            let _ = child.kill();
            let _ = child.wait();
        }
    }
}
