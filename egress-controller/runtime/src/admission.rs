use crate::k8s::{
    validation::{protocol_warnings, validate_spec},
    EgressRules, EgressRulesSpec,
};
use anyhow::{anyhow, Result};
use futures::future;
use http_body_util::BodyExt;
use hyper::{http, Request, Response};
use kube::{
    core::{admission::Operation, DynamicObject},
    Resource,
};
use serde::de::DeserializeOwned;
use thiserror::Error;
use tracing::{debug, info, trace, warn};

/// Validates `EgressRules` resources before they are persisted.
#[derive(Clone)]
pub struct Admission {}

#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to read request body: {0}")]
    Request(#[from] hyper::Error),

    #[error("failed to encode json response: {0}")]
    Json(#[from] serde_json::Error),
}

type AdmissionRequest = kube::core::admission::AdmissionRequest<DynamicObject>;
type AdmissionResponse = kube::core::admission::AdmissionResponse;
type AdmissionReview = kube::core::admission::AdmissionReview<DynamicObject>;

type Body = http_body_util::Full<bytes::Bytes>;

// === impl Admission ===

impl tower::Service<Request<hyper::body::Incoming>> for Admission {
    type Response = Response<Body>;
    type Error = Error;
    type Future = future::BoxFuture<'static, Result<Response<Body>, Error>>;

    fn poll_ready(
        &mut self,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::result::Result<(), Self::Error>> {
        std::task::Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Request<hyper::body::Incoming>) -> Self::Future {
        trace!(?req);
        if req.method() != http::Method::POST || req.uri().path() != "/" {
            return Box::pin(future::ok(
                Response::builder()
                    .status(http::StatusCode::NOT_FOUND)
                    .body(Body::default())
                    .expect("not found response must be valid"),
            ));
        }

        let admission = self.clone();
        Box::pin(async move {
            let bytes = req.into_body().collect().await?.to_bytes();
            let review: AdmissionReview = match serde_json::from_slice(&bytes) {
                Ok(review) => review,
                Err(error) => {
                    warn!(%error, "Failed to parse request body");
                    return json_response(AdmissionResponse::invalid(error).into_review());
                }
            };
            trace!(?review);

            let rsp = match review.try_into() {
                Ok(req) => {
                    debug!(?req);
                    admission.admit(req)
                }
                Err(error) => {
                    warn!(%error, "Invalid admission request");
                    AdmissionResponse::invalid(error)
                }
            };
            debug!(?rsp);
            json_response(rsp.into_review())
        })
    }
}

impl Admission {
    pub fn new() -> Self {
        Self {}
    }

    fn admit(&self, req: AdmissionRequest) -> AdmissionResponse {
        if is_kind::<EgressRules>(&req) {
            return self.admit_egress_rules(req);
        }

        AdmissionResponse::invalid(format_args!(
            "unsupported resource type: {}.{}.{}",
            req.kind.group, req.kind.version, req.kind.kind
        ))
    }

    fn admit_egress_rules(&self, req: AdmissionRequest) -> AdmissionResponse {
        let mut rsp = AdmissionResponse::from(&req);
        if req.operation == Operation::Delete {
            return rsp;
        }

        let name = req.name.clone();
        let spec = match parse_spec::<EgressRulesSpec>(req) {
            Ok(spec) => spec,
            Err(error) => {
                info!(%error, %name, "Failed to parse EgressRules spec");
                return rsp.deny(error);
            }
        };

        if let Err(error) = validate_spec(&spec) {
            info!(%error, %name, "Denied");
            return rsp.deny(error);
        }

        let warnings = protocol_warnings(&spec);
        if !warnings.is_empty() {
            info!(%name, warnings = warnings.len(), "Admitted with warnings");
            rsp.warnings = Some(warnings);
        }
        rsp
    }
}

fn is_kind<T>(req: &AdmissionRequest) -> bool
where
    T: Resource,
    T::DynamicType: Default,
{
    let dt = Default::default();
    req.kind.group.eq_ignore_ascii_case(&T::group(&dt))
        && req.kind.kind.eq_ignore_ascii_case(&T::kind(&dt))
}

fn json_response(rsp: AdmissionReview) -> Result<Response<Body>, Error> {
    let bytes = serde_json::to_vec(&rsp)?;
    Ok(Response::builder()
        .status(http::StatusCode::OK)
        .header(http::header::CONTENT_TYPE, "application/json")
        .body(Body::from(bytes))
        .expect("admission review response must be valid"))
}

fn parse_spec<T: DeserializeOwned>(req: AdmissionRequest) -> Result<T> {
    let obj = req
        .object
        .ok_or_else(|| anyhow!("admission request missing 'object'"))?;
    let data = obj
        .data
        .get("spec")
        .cloned()
        .ok_or_else(|| anyhow!("admission request missing 'spec'"))?;
    Ok(serde_json::from_value(data)?)
}
