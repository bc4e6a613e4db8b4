//! Request routing
//!
//! Order of evaluation:
//! 1. `/api/` goes to the upstream forwarder (any method), or 404 without one
//! 2. anything but GET is refused with 405
//! 3. `/files/` serves files, index pages and PHP scripts; bare `/files`
//!    redirects to `/files/`
//! 4. every other path is a directory listing
//!
//! Redirect targets are always rebuilt from the resolved relative path, never
//! echoed from the request.

use crate::error::{BoxError, GatewayBody, GatewayError};
use crate::listing::list_directory;
use crate::php::PhpExecutor;
use crate::proxy::{Forwarder, API_PREFIX};
use crate::render::{render_listing, DirectoryProbe};
use crate::resolver::{
    resolve, resolve_child, strip_files_prefix, strip_listing_prefix, ResolvedTarget, TargetKind,
    FILES_PREFIX,
};
use crate::static_files::serve_file;
use http_body_util::BodyExt;
use hyper::body::{Body, Bytes};
use hyper::{Method, Request, Response, StatusCode};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

const INDEX_HTML: &str = "index.html";
const INDEX_PHP: &str = "index.php";

/// Routes each request to the listing, file, PHP or proxy handler
pub struct Dispatcher {
    root: PathBuf,
    php: Arc<PhpExecutor>,
    forwarder: Option<Forwarder>,
}

impl Dispatcher {
    /// `root` must be the canonical content root
    pub fn new(root: PathBuf, php: Arc<PhpExecutor>, forwarder: Option<Forwarder>) -> Self {
        Self {
            root,
            php,
            forwarder,
        }
    }

    pub fn php(&self) -> &Arc<PhpExecutor> {
        &self.php
    }

    /// Handle one request. Errors become plain-text responses.
    pub async fn handle<B>(&self, req: Request<B>, client_addr: SocketAddr) -> Response<GatewayBody>
    where
        B: Body<Data = Bytes> + Send + Sync + 'static,
        B::Error: Into<BoxError>,
    {
        let req: Request<GatewayBody> = req.map(|body| body.map_err(Into::into).boxed());
        let method = req.method().clone();
        let path = req.uri().path().to_string();
        let start = Instant::now();

        match self.route(req, client_addr).await {
            Ok(response) => {
                info!(
                    method = %method,
                    path,
                    status = response.status().as_u16(),
                    elapsed_ms = start.elapsed().as_millis() as u64,
                    "Request handled"
                );
                response
            }
            Err(e) => {
                let status = e.code().status_code();
                if status.is_server_error() {
                    error!(method = %method, path, status = status.as_u16(), error = %e, "Request failed");
                } else {
                    warn!(method = %method, path, status = status.as_u16(), error = %e, "Request rejected");
                }
                e.into_response()
            }
        }
    }

    async fn route(
        &self,
        req: Request<GatewayBody>,
        client_addr: SocketAddr,
    ) -> Result<Response<GatewayBody>, GatewayError> {
        let path = req.uri().path().to_string();

        if path.starts_with(API_PREFIX) {
            return match &self.forwarder {
                Some(forwarder) => forwarder.forward(req, client_addr).await,
                None => Err(GatewayError::RouteNotFound(path)),
            };
        }

        if req.method() != Method::GET {
            return Err(GatewayError::MethodNotAllowed(req.method().clone()));
        }

        if path == FILES_PREFIX.trim_end_matches('/') {
            return Ok(redirect(FILES_PREFIX));
        }

        if let Some(relative) = strip_files_prefix(&path) {
            return self.serve_files(relative, req).await;
        }

        self.serve_listing(&path).await
    }

    /// `/files/<path>`: static files, index pages and PHP scripts
    async fn serve_files(
        &self,
        relative: &str,
        req: Request<GatewayBody>,
    ) -> Result<Response<GatewayBody>, GatewayError> {
        let target = resolve(&self.root, relative).await?;

        match target.kind {
            TargetKind::Missing => Err(GatewayError::NotFound(target.path)),
            TargetKind::RegularFile => self.serve_target(&target, req).await,
            // Relative links in an index page need a slash-terminated URL
            TargetKind::Directory if !relative.is_empty() && !relative.ends_with('/') => {
                Ok(redirect(&files_href(&target.relative)))
            }
            TargetKind::Directory => {
                let index_html = resolve_child(&self.root, &target, INDEX_HTML).await?;
                if index_html.kind == TargetKind::RegularFile {
                    debug!(path = %index_html.path.display(), "Serving index.html");
                    return serve_file(&index_html.path, req.headers()).await;
                }

                let index_php = resolve_child(&self.root, &target, INDEX_PHP).await?;
                if index_php.kind == TargetKind::RegularFile {
                    debug!(path = %index_php.path.display(), "Serving index.php");
                    return self.php.execute(&index_php, req).await;
                }

                Ok(redirect(&listing_href(&target.relative)))
            }
        }
    }

    async fn serve_target(
        &self,
        target: &ResolvedTarget,
        req: Request<GatewayBody>,
    ) -> Result<Response<GatewayBody>, GatewayError> {
        if target.is_php() {
            self.php.execute(target, req).await
        } else {
            serve_file(&target.path, req.headers()).await
        }
    }

    /// Render the listing of the directory named by `path`
    async fn serve_listing(&self, path: &str) -> Result<Response<GatewayBody>, GatewayError> {
        let relative = strip_listing_prefix(path);
        let target = resolve(&self.root, relative).await?;

        // Relative `{name}/` links only resolve under a slash-terminated URL
        if target.is_directory() && !relative.is_empty() && !relative.ends_with('/') {
            return Ok(redirect(&listing_href(&target.relative)));
        }

        let current = if target.relative.is_empty() {
            String::new()
        } else {
            format!("{}/", target.relative)
        };
        let listing = list_directory(&target, &current).await?;

        let dir = target.path.clone();
        let html = tokio::task::spawn_blocking(move || {
            render_listing(&listing, &DirectoryProbe::new(&dir))
        })
        .await
        .map_err(|e| GatewayError::Io {
            path: target.path.clone(),
            source: std::io::Error::other(e),
        })?;

        Response::builder()
            .status(StatusCode::OK)
            .header(hyper::header::CONTENT_TYPE, "text/html; charset=utf-8")
            .body(crate::error::full_body(html))
            .map_err(|e| GatewayError::Io {
                path: target.path,
                source: std::io::Error::other(e),
            })
    }
}

/// Listing URL for a directory relative to the content root
fn listing_href(relative: &str) -> String {
    directory_href("/", relative)
}

/// `/files/` URL for a directory relative to the content root
fn files_href(relative: &str) -> String {
    directory_href(FILES_PREFIX, relative)
}

fn directory_href(prefix: &str, relative: &str) -> String {
    let mut href = String::from(prefix);
    for segment in relative.split('/').filter(|s| !s.is_empty()) {
        href.push_str(&urlencoding::encode(segment));
        href.push('/');
    }
    href
}

fn redirect(location: &str) -> Response<GatewayBody> {
    Response::builder()
        .status(StatusCode::MOVED_PERMANENTLY)
        .header(hyper::header::LOCATION, location)
        .body(crate::error::full_body(""))
        .unwrap_or_else(|_| {
            GatewayError::Io {
                path: PathBuf::from(location),
                source: std::io::Error::other("invalid redirect location"),
            }
            .into_response()
        })
}
