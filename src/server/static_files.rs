use crate::{Error, Handler, HandlerError, Request, Response};
use std::{
    io,
    path::{Path, PathBuf},
};
use tokio::fs;

/// A file found under a static mount.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaticFile {
    /// Canonical path, always inside the canonical root.
    pub path: PathBuf,
    /// MIME type guessed from the extension.
    pub content_type: &'static str,
}

/// Maps `request_path` under the mount `prefix` to a file below `root`.
///
/// `request_path` is the decoded path of the request. Segments are split on
/// both `/` and `\`.
///
/// # Errors
/// - [`Error::Forbidden`] when a segment is `..`, or the file resolves
///   (through symlinks) outside of `root`
/// - [`Error::NotFound`] when the path does not start with `prefix`, does not
///   exist, or is a directory without an `index.html`
///
/// # Examples
/// ```no_run
/// use pico_web::{resolve_static, Error};
/// use std::path::Path;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let file = resolve_static("/static", Path::new("./public"), "/static/app.js").await;
/// assert_eq!(file.unwrap().content_type, "text/javascript");
///
/// let err = resolve_static("/static", Path::new("./public"), "/static/../secret").await;
/// assert!(matches!(err, Err(Error::Forbidden)));
/// # }
/// ```
pub async fn resolve(prefix: &str, root: &Path, request_path: &str) -> Result<StaticFile, Error> {
    let rest = strip_mount(prefix, request_path).ok_or(Error::NotFound)?;

    let mut candidate = root.to_path_buf();
    for segment in rest.split(|c: char| c == '/' || c == '\\') {
        match segment {
            "" | "." => continue,
            ".." => return Err(Error::Forbidden),
            s if s.contains('\0') => return Err(Error::NotFound),
            s => candidate.push(s),
        }
    }

    let root = fs::canonicalize(root).await.map_err(|_| Error::NotFound)?;
    let mut path = contained(&root, &candidate).await?;

    if fs::metadata(&path).await.map_err(fs_error)?.is_dir() {
        path = contained(&root, &path.join("index.html")).await?;
        if !fs::metadata(&path).await.map_err(fs_error)?.is_file() {
            return Err(Error::NotFound);
        }
    }

    Ok(StaticFile {
        content_type: mime_type(&path),
        path,
    })
}

/// Canonicalizes `candidate` and checks that it stays below `root`.
async fn contained(root: &Path, candidate: &Path) -> Result<PathBuf, Error> {
    let path = fs::canonicalize(candidate).await.map_err(fs_error)?;
    match path.starts_with(root) {
        true => Ok(path),
        false => Err(Error::Forbidden),
    }
}

fn fs_error(err: io::Error) -> Error {
    match err.kind() {
        io::ErrorKind::PermissionDenied => Error::Forbidden,
        _ => Error::NotFound,
    }
}

/// The part of `path` below `prefix`, respecting segment boundaries.
fn strip_mount<'a>(prefix: &str, path: &'a str) -> Option<&'a str> {
    let rest = path.strip_prefix(prefix.trim_end_matches('/'))?;
    match rest.is_empty() || rest.starts_with('/') {
        true => Some(rest),
        false => None,
    }
}

/// Content type for a file name, by extension.
///
/// Unknown extensions are `application/octet-stream`.
pub fn mime_type(path: &Path) -> &'static str {
    let Some(ext) = path.extension().and_then(|ext| ext.to_str()) else {
        return "application/octet-stream";
    };

    match ext.to_ascii_lowercase().as_str() {
        "html" | "htm" => "text/html",
        "css" => "text/css",
        "js" | "mjs" => "text/javascript",
        "json" => "application/json",
        "txt" => "text/plain",
        "csv" => "text/csv",
        "xml" => "application/xml",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "svg" => "image/svg+xml",
        "ico" => "image/x-icon",
        "webp" => "image/webp",
        "pdf" => "application/pdf",
        "zip" => "application/zip",
        "gz" => "application/gzip",
        "wasm" => "application/wasm",
        "mp3" => "audio/mpeg",
        "ogg" => "audio/ogg",
        "wav" => "audio/wav",
        "webm" => "audio/webm",
        "mp4" => "video/mp4",
        "woff" => "font/woff",
        "woff2" => "font/woff2",
        _ => "application/octet-stream",
    }
}

/// Handler serving one static mount.
///
/// Registered as `GET <prefix>/{*path}`; HEAD reaches it through the GET
/// route.
#[derive(Debug)]
pub(crate) struct StaticFiles {
    prefix: String,
    root: PathBuf,
}

impl StaticFiles {
    pub(crate) fn new(prefix: &str, root: PathBuf) -> Self {
        Self {
            prefix: prefix.trim_end_matches('/').to_owned(),
            root,
        }
    }

    /// Route pattern covering everything below the prefix.
    pub(crate) fn pattern(&self) -> String {
        format!("{}/{{*path}}", self.prefix)
    }
}

impl Handler for StaticFiles {
    type Output = ();

    async fn handle(&self, req: &mut Request<'_>, resp: &mut Response) -> Result<(), HandlerError> {
        let file = resolve(&self.prefix, &self.root, req.path()).await?;
        resp.header("content-type", file.content_type).file(&file.path).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Method;

    struct Site {
        _dir: tempfile::TempDir,
        root: PathBuf,
    }

    fn site() -> Site {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("public");
        std::fs::create_dir_all(root.join("docs")).unwrap();
        std::fs::create_dir_all(root.join("app")).unwrap();
        std::fs::write(root.join("a.txt"), "hi").unwrap();
        std::fs::write(root.join("app/index.html"), "<h1>app</h1>").unwrap();
        std::fs::write(root.join("app/main.js"), "run()").unwrap();
        std::fs::write(dir.path().join("secret.txt"), "nope").unwrap();
        Site { _dir: dir, root }
    }

    #[tokio::test]
    async fn serves_files() {
        let site = site();

        #[rustfmt::skip]
        let cases = [
            ("/static",  "/static/a.txt",        "a.txt",           "text/plain"),
            ("/static/", "/static/a.txt",        "a.txt",           "text/plain"),
            ("/static",  "/static/app",          "app/index.html",  "text/html"),
            ("/static",  "/static/app/main.js",  "app/main.js",     "text/javascript"),
            ("/",        "/a.txt",               "a.txt",           "text/plain"),
        ];

        for (prefix, path, expected, mime) in cases {
            let file = resolve(prefix, &site.root, path).await.unwrap();
            let expected = std::fs::canonicalize(site.root.join(expected)).unwrap();
            assert_eq!(file.path, expected, "{path}");
            assert_eq!(file.content_type, mime);
        }
    }

    #[tokio::test]
    async fn never_leaves_root() {
        let site = site();

        #[rustfmt::skip]
        let cases = [
            "/static/../secret.txt",
            "/static/%2e%2e%2fsecret.txt",
            "/static/..%5Csecret.txt",
            "/static/app/../../secret.txt",
            "/static/.%2E/secret.txt",
        ];

        for target in cases {
            // Decoded the same way the parser does it
            let request = Request::detached(Method::Get, target).unwrap();
            let err = resolve("/static", &site.root, request.path()).await.unwrap_err();
            assert!(matches!(err, Error::Forbidden), "{target}: {err}");
        }
    }

    #[tokio::test]
    async fn not_found() {
        let site = site();

        #[rustfmt::skip]
        let cases = [
            "/static/missing.txt",
            "/static/docs",
            "/static/a.txt/more",
            "/staticx/a.txt",
            "/other/a.txt",
        ];

        for path in cases {
            let err = resolve("/static", &site.root, path).await.unwrap_err();
            assert!(matches!(err, Error::NotFound), "{path}: {err}");
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn symlink_escape() {
        let site = site();
        let outside = site.root.parent().unwrap().join("secret.txt");
        std::os::unix::fs::symlink(outside, site.root.join("leak.txt")).unwrap();

        let err = resolve("/static", &site.root, "/static/leak.txt").await.unwrap_err();
        assert!(matches!(err, Error::Forbidden));
    }

    #[test]
    fn mime_types() {
        #[rustfmt::skip]
        let cases = [
            ("index.html",  "text/html"),
            ("style.CSS",   "text/css"),
            ("photo.jpeg",  "image/jpeg"),
            ("icon.svg",    "image/svg+xml"),
            ("data.json",   "application/json"),
            ("font.woff2",  "font/woff2"),
            ("archive.gz",  "application/gzip"),
            ("firmware.bin", "application/octet-stream"),
            ("README",      "application/octet-stream"),
        ];

        for (name, expected) in cases {
            assert_eq!(mime_type(Path::new(name)), expected, "{name}");
        }
    }

    #[test]
    fn patterns() {
        #[rustfmt::skip]
        let cases = [
            ("/static",   "/static/{*path}"),
            ("/static/",  "/static/{*path}"),
            ("/",         "/{*path}"),
        ];

        for (prefix, expected) in cases {
            assert_eq!(StaticFiles::new(prefix, PathBuf::new()).pattern(), expected);
        }
    }
}
