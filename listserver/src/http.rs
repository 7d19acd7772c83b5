//! The minimal HTTP reply used when a browser asks for the list.

use chrono::{DateTime, Utc};
use std::time::SystemTime;

pub const SERVER_NAME: &str = concat!("tanklist/", env!("CARGO_PKG_VERSION"));

/// Formats a time as `Sun, 06 Nov 1994 08:49:37 GMT`.
pub fn rfc1123_date(time: SystemTime) -> String {
    DateTime::<Utc>::from(time)
        .format("%a, %d %b %Y %H:%M:%S GMT")
        .to_string()
}

/// Response headers sent ahead of the LIST body on a GET.
pub fn response_header(now: SystemTime, last_modified: SystemTime) -> String {
    format!(
        "HTTP/1.1 200 OK\r\n\
         Date: {}\r\n\
         Server: {}\r\n\
         Last-Modified: {}\r\n\
         Connection: close\r\n\
         Content-Type: text/plain\r\n\
         \r\n",
        rfc1123_date(now),
        SERVER_NAME,
        rfc1123_date(last_modified)
    )
}
