use std::path::{Path, PathBuf};

use serde_json::Value;

use crate::embodiment::Embodiment;
use crate::error::RxError;

#[async_trait]
/// The template-rendering collaborator.
///
/// The dispatch core does not define a templating language; when a resource
/// declares a view and the request accepts HTML, the core hands the view
/// name, optional layout, and the response data to whatever engine the site
/// was configured with, and ships the embodiment it produces.
pub trait ViewEngine: Send + Sync + 'static {
    /// Renders the named view with the given data into an embodiment.
    async fn render(
        &self,
        view: &str,
        layout: Option<&str>,
        data: &Value,
    ) -> Result<Embodiment, RxError>;
}

impl std::fmt::Debug for dyn ViewEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ViewEngine")
    }
}

/// Serves a literal file path from under `base`.  Traversal segments are
/// stripped before the path ever touches the filesystem; directories fall
/// back to their `index.html`.
pub(crate) async fn serve_static(base: &Path, pathname: &str) -> Result<Embodiment, RxError> {
    let mut path = match resolve_path(base, pathname) {
        Some(path) => path,
        None => return Err(RxError::not_found(pathname)),
    };

    match tokio::fs::metadata(&path).await {
        Ok(meta) if meta.is_dir() => path.push("index.html"),
        Ok(_) => {}
        Err(_) => return Err(RxError::not_found(pathname)),
    }

    let contents = tokio::fs::read(&path)
        .await
        .map_err(|_| RxError::not_found(pathname))?;
    let mime_type = mime_guess::MimeGuess::from_path(&path).first_or_octet_stream();
    log::info!("serving {} bytes (as {})", contents.len(), mime_type);
    Ok(Embodiment::buffered(
        mime_type.to_string(),
        http::StatusCode::OK,
        contents,
    ))
}

fn resolve_path(base: &Path, pathname: &str) -> Option<PathBuf> {
    let mut buffer = base.to_path_buf();
    let mut depth = 0usize;
    for segment in pathname.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                if depth == 0 {
                    return None;
                }
                depth -= 1;
                buffer.pop();
            }
            other => {
                depth += 1;
                buffer.push(other);
            }
        }
    }
    Some(buffer)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_path_joins_segments() {
        let base = Path::new("/srv/assets");
        assert_eq!(
            resolve_path(base, "/css/app.css"),
            Some(PathBuf::from("/srv/assets/css/app.css"))
        );
        assert_eq!(
            resolve_path(base, "/css/./app.css"),
            Some(PathBuf::from("/srv/assets/css/app.css"))
        );
    }

    #[test]
    fn resolve_path_refuses_escapes() {
        let base = Path::new("/srv/assets");
        assert_eq!(resolve_path(base, "/../etc/passwd"), None);
        assert_eq!(resolve_path(base, "/css/../../etc/passwd"), None);
        // descending and coming back up stays inside the base
        assert_eq!(
            resolve_path(base, "/css/../app.css"),
            Some(PathBuf::from("/srv/assets/app.css"))
        );
    }

    #[tokio::test]
    async fn missing_files_are_not_found() {
        let err = serve_static(Path::new("/nonexistent-base"), "/nothing.css")
            .await
            .unwrap_err();
        assert_eq!(err.status(), http::StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn existing_files_are_served_with_their_mime_type() {
        let dir = std::env::temp_dir().join("resin-static-test");
        tokio::fs::create_dir_all(&dir).await.unwrap();
        tokio::fs::write(dir.join("style.css"), b"body {}").await.unwrap();

        let reply = serve_static(&dir, "/style.css").await.unwrap();
        assert_eq!(reply.status, http::StatusCode::OK);
        assert_eq!(reply.mime_type, "text/css");
        assert_eq!(&reply.body_bytes().unwrap()[..], b"body {}");
    }
}
