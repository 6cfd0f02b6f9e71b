//! Request building utilities.

use crate::basic_auth;

/// Extension trait for HTTP requests.
pub trait RequestExt {
    /// Add a basic authentication header to the request.
    fn basic_auth<U, P>(self, username: U, password: Option<P>) -> Self
    where
        U: std::fmt::Display,
        P: std::fmt::Display;

    /// Get the parts of the request, excluding the body, without
    /// consuming the request.
    fn parts(&self) -> http::request::Parts;
}

impl<B> RequestExt for http::Request<B> {
    fn basic_auth<U, P>(mut self, username: U, password: Option<P>) -> Self
    where
        U: std::fmt::Display,
        P: std::fmt::Display,
    {
        let hdrs = self.headers_mut();
        hdrs.append(http::header::AUTHORIZATION, basic_auth(username, password));

        self
    }

    fn parts(&self) -> http::request::Parts {
        let mut builder = http::request::Request::builder()
            .uri(self.uri().clone())
            .method(self.method().clone());

        if let Some(headers) = builder.headers_mut() {
            *headers = self.headers().clone();
        }

        let (parts, _) = builder.body(()).expect("valid request").into_parts();
        parts
    }
}

impl RequestExt for http::request::Builder {
    fn basic_auth<U, P>(self, username: U, password: Option<P>) -> Self
    where
        U: std::fmt::Display,
        P: std::fmt::Display,
    {
        self.header(http::header::AUTHORIZATION, basic_auth(username, password))
    }

    fn parts(&self) -> http::request::Parts {
        let mut builder = http::request::Request::builder()
            .uri(self.uri_ref().expect("valid request").clone())
            .method(self.method_ref().expect("valid request").clone());

        if let Some(headers) = builder.headers_mut() {
            *headers = self.headers_ref().expect("valid request").clone();
        }

        let (parts, _) = builder.body(()).expect("valid request").into_parts();
        parts
    }
}
