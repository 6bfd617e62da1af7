//! Response body helpers.

use bytes::Bytes;
use futures_util::{StreamExt, stream};
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, BodyStream, Empty, Full, StreamBody};
use hyper::body::{Frame, Incoming};

/// Body type of every response the proxy produces.
pub type ProxyBody = UnsyncBoxBody<Bytes, hyper::Error>;

/// Create an empty body.
pub fn empty_body() -> ProxyBody {
    Empty::<Bytes>::new()
        .map_err(|never| match never {})
        .boxed_unsync()
}

/// Create a body with fixed content.
pub fn full_body(content: impl Into<Bytes>) -> ProxyBody {
    Full::new(content.into())
        .map_err(|never| match never {})
        .boxed_unsync()
}

/// Replay already-read chunks, then continue with the rest of `rest`.
pub fn resume_body(buffered: Vec<Bytes>, rest: Incoming) -> ProxyBody {
    let head = stream::iter(buffered.into_iter().map(|chunk| Ok(Frame::data(chunk))));
    let tail = BodyStream::new(rest);
    StreamBody::new(head.chain(tail)).boxed_unsync()
}
