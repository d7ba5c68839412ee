// src/service.rs
use crate::gateway::{Gateway, GatewayRequest};
use crate::http::{Request, Status};
use crate::mime::HTML_MIME;
use crate::resource::{self, Resource};
use crate::response::Body;
use std::borrow::Cow;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::warn;

/// What to send back for one parsed request.
#[derive(Debug)]
pub struct Reply {
    pub status: Status,
    pub content_type: Cow<'static, str>,
    pub body: Body,
}

impl Reply {
    pub fn error(status: Status) -> Self {
        Self {
            status,
            content_type: Cow::Borrowed(HTML_MIME),
            body: Body::Static(status.page()),
        }
    }
}

/// Turns requests into replies: static files from the document root,
/// executables through the gateway.
pub struct Service {
    doc_root: PathBuf,
    gateway: Arc<dyn Gateway>,
}

impl Service {
    pub fn new(doc_root: impl Into<PathBuf>, gateway: Arc<dyn Gateway>) -> Self {
        Self {
            doc_root: doc_root.into(),
            gateway,
        }
    }

    pub fn respond(&self, req: &Request) -> Reply {
        match resource::resolve(&self.doc_root, req) {
            Err(status) => Reply::error(status),
            Ok(Resource::File { map, mime }) => Reply {
                status: Status::Ok,
                content_type: Cow::Borrowed(mime),
                body: Body::Mapped(map),
            },
            // Nothing to map; answer with the default page instead.
            Ok(Resource::EmptyFile) => Reply {
                status: Status::Ok,
                content_type: Cow::Borrowed(HTML_MIME),
                body: Body::Static(Status::Ok.page()),
            },
            Ok(Resource::Script(script)) => self.run_script(req, &script),
        }
    }

    fn run_script(&self, req: &Request, script: &Path) -> Reply {
        let gateway_req = GatewayRequest {
            script,
            doc_root: &self.doc_root,
            method: req.method,
            path: &req.path,
            query: req.query.as_deref().unwrap_or(""),
            body: &req.body,
            content_type: req.content_type.as_deref(),
            cookie: req.cookie.as_deref(),
        };
        match self.gateway.invoke(&gateway_req) {
            Ok(res) => Reply {
                status: Status::Ok,
                content_type: res
                    .content_type
                    .map(Cow::Owned)
                    .unwrap_or(Cow::Borrowed(HTML_MIME)),
                body: Body::Generated(res.body),
            },
            Err(e) => {
                warn!(script = %script.display(), error = %e, "gateway failed");
                Reply::error(Status::InternalError)
            }
        }
    }
}
