//! Request/Response Bridge
//!
//! Converts native hyper requests into the script-visible request object and
//! collects script-side response calls into a single [`HttpReply`].

mod request;
mod response;


pub use request::{is_json_content_type, parse_query, RequestView};
pub use response::{serialize_cookie, CookieOptions, HttpReply, ResponseBuilder, SendBody};
