use std::collections::HashSet;
use std::marker::PhantomData;

use headers::authorization::{Bearer, Credentials};
use http::{header, Request, Response, StatusCode};
use tower_http::validate_request::ValidateRequest;

/// Accepts any of the configured bearer tokens; an empty set lets everything through.
pub struct ManyValidate<ResBody> {
    tokens: HashSet<String>,
    _ty: PhantomData<fn() -> ResBody>,
}

impl<ResBody> ManyValidate<ResBody> {
    pub fn new(tokens: Vec<String>) -> Self {
        Self {
            tokens: tokens.into_iter().collect(),
            _ty: PhantomData,
        }
    }
}

impl<ResBody> Clone for ManyValidate<ResBody> {
    fn clone(&self) -> Self {
        Self {
            tokens: self.tokens.clone(),
            _ty: PhantomData,
        }
    }
}

impl<B, ResBody: Default> ValidateRequest<B> for ManyValidate<ResBody> {
    type ResponseBody = ResBody;

    fn validate(&mut self, request: &mut Request<B>) -> Result<(), Response<Self::ResponseBody>> {
        if self.tokens.is_empty() {
            return Ok(());
        }
        let authorized = request
            .headers()
            .get(header::AUTHORIZATION)
            .and_then(Bearer::decode)
            .is_some_and(|bearer| self.tokens.contains(bearer.token()));
        if authorized {
            return Ok(());
        }
        let mut res = Response::new(ResBody::default());
        *res.status_mut() = StatusCode::UNAUTHORIZED;
        Err(res)
    }
}
