//! Authenticate -> Authorize -> operation, as an ordered list of stages.
//!
//! Every stage sees the same `RequestContext` and either lets the request
//! continue (`Ok`) or stops it with an `AppError`. The axum glue at the
//! bottom builds the context from the request, runs the chain, and hands
//! failures to the `errors` layer for classification.

use std::{collections::HashMap, fmt, sync::Arc};

use axum::{
    extract::{FromRequestParts, RawPathParams, Request, State},
    http::{HeaderMap, header, request::Parts},
    middleware::Next,
    response::{IntoResponse, Response},
};

use crate::{
    AppState,
    error::{AppError, AuthFailure},
    policy::{Decision, PolicyEvaluator, Rule},
    verify::{TokenVerifier, VerifiedIdentity},
};

/// RequestContext
///
/// What the stages know about one request. `identity` is filled in by
/// `Authenticate` and read by everything after it.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    pub bearer: Option<String>,
    pub path_params: HashMap<String, String>,
    pub identity: Option<VerifiedIdentity>,
}

impl RequestContext {
    pub fn with_bearer(mut self, token: impl Into<String>) -> Self {
        self.bearer = Some(token.into());
        self
    }

    pub fn with_path_param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.path_params.insert(name.into(), value.into());
        self
    }

    /// Builds a context from request headers and matched path parameters.
    pub fn from_parts(headers: &HeaderMap, path_params: HashMap<String, String>) -> Self {
        Self {
            bearer: bearer_token(headers).map(str::to_string),
            path_params,
            identity: None,
        }
    }
}

/// Pulls the token out of `Authorization: Bearer <token>`. The scheme is
/// matched case-insensitively.
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = value.split_once(' ')?;
    let token = token.trim();
    (scheme.eq_ignore_ascii_case("bearer") && !token.is_empty()).then_some(token)
}

/// Stage
///
/// One step of the chain. A stage may read and extend the context; returning
/// an error stops the chain.
pub trait Stage: Send + Sync {
    fn name(&self) -> &'static str;

    fn run(&self, ctx: &mut RequestContext) -> Result<(), AppError>;
}

/// Authenticate
///
/// Verifies the bearer token and records the identity.
pub struct Authenticate {
    verifier: Arc<TokenVerifier>,
}

impl Authenticate {
    pub fn new(verifier: Arc<TokenVerifier>) -> Self {
        Self { verifier }
    }
}

impl Stage for Authenticate {
    fn name(&self) -> &'static str {
        "authenticate"
    }

    fn run(&self, ctx: &mut RequestContext) -> Result<(), AppError> {
        let token = ctx.bearer.as_deref().ok_or(AuthFailure::MissingToken)?;

        match self.verifier.verify(token) {
            Ok(identity) => {
                tracing::debug!(sub = %identity.subject, "authenticated");
                ctx.identity = Some(identity);
                Ok(())
            }
            Err(reason) => {
                tracing::warn!(kind = reason.kind(), %reason, "token rejected");
                Err(reason.into())
            }
        }
    }
}

/// SubjectSource
///
/// Where `AdminOrSubject` finds the subject the request is about.
#[derive(Clone)]
pub enum SubjectSource {
    None,
    PathParam(&'static str),
    Custom(Arc<dyn Fn(&RequestContext) -> Option<String> + Send + Sync>),
}

impl fmt::Debug for SubjectSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SubjectSource::None => f.write_str("None"),
            SubjectSource::PathParam(name) => f.debug_tuple("PathParam").field(name).finish(),
            SubjectSource::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

impl SubjectSource {
    fn extract(&self, ctx: &RequestContext) -> Option<String> {
        match self {
            SubjectSource::None => None,
            SubjectSource::PathParam(name) => ctx.path_params.get(*name).cloned(),
            SubjectSource::Custom(hook) => hook(ctx),
        }
    }
}

/// Authorize
///
/// Evaluates the rule bound to this route against the authenticated identity.
pub struct Authorize {
    policy: Arc<PolicyEvaluator>,
    rule: Rule,
    subject: SubjectSource,
}

impl Authorize {
    pub fn new(policy: Arc<PolicyEvaluator>, rule: Rule) -> Self {
        Self {
            policy,
            rule,
            subject: SubjectSource::None,
        }
    }

    /// Binds a rule by its configured name. An unknown name still yields a
    /// stage, one that refuses every request and logs why.
    pub fn named(policy: Arc<PolicyEvaluator>, name: &str) -> Box<dyn Stage> {
        match policy.lookup(name) {
            Ok(rule) => Box::new(Self::new(policy, rule)),
            Err(err) => {
                tracing::error!(error = %err, "route bound to unknown rule");
                Box::new(Refuse(AuthFailure::Misconfigured(err)))
            }
        }
    }

    pub fn with_subject(mut self, subject: SubjectSource) -> Self {
        self.subject = subject;
        self
    }
}

impl Stage for Authorize {
    fn name(&self) -> &'static str {
        "authorize"
    }

    fn run(&self, ctx: &mut RequestContext) -> Result<(), AppError> {
        let identity = ctx.identity.as_ref().ok_or(AuthFailure::MissingIdentity)?;
        let target = self.subject.extract(ctx);

        match self.policy.evaluate(self.rule, identity, target.as_deref()) {
            Decision::Allow => Ok(()),
            Decision::Deny => {
                tracing::warn!(
                    rule = %self.rule,
                    sub = %identity.subject,
                    target = ?target,
                    "authorization denied"
                );
                Err(AuthFailure::Denied { rule: self.rule }.into())
            }
        }
    }
}

/// A stage that always fails with the same auth failure.
struct Refuse(AuthFailure);

impl Stage for Refuse {
    fn name(&self) -> &'static str {
        "refuse"
    }

    fn run(&self, _ctx: &mut RequestContext) -> Result<(), AppError> {
        Err(self.0.clone().into())
    }
}

/// AuthChain
///
/// An ordered list of stages. Stages run in insertion order and the first
/// failure wins; later stages and the wrapped operation never run.
#[derive(Clone, Default)]
pub struct AuthChain {
    stages: Vec<Arc<dyn Stage>>,
}

impl fmt::Debug for AuthChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.stages.iter().map(|stage| stage.name()))
            .finish()
    }
}

impl AuthChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Authenticate, then authorize with `rule`.
    pub fn protect(
        verifier: Arc<TokenVerifier>,
        policy: Arc<PolicyEvaluator>,
        rule: Rule,
        subject: SubjectSource,
    ) -> Self {
        Self::new()
            .stage(Authenticate::new(verifier))
            .stage(Authorize::new(policy, rule).with_subject(subject))
    }

    pub fn stage(mut self, stage: impl Stage + 'static) -> Self {
        self.stages.push(Arc::new(stage));
        self
    }

    pub fn boxed_stage(mut self, stage: Box<dyn Stage>) -> Self {
        self.stages.push(Arc::from(stage));
        self
    }

    pub fn run(&self, ctx: &mut RequestContext) -> Result<(), AppError> {
        for stage in &self.stages {
            stage.run(ctx)?;
        }
        Ok(())
    }

    /// execute
    ///
    /// Runs the stages, then `operation` with the verified identity. The
    /// operation is only invoked if every stage passed.
    pub async fn execute<F, Fut, T>(&self, mut ctx: RequestContext, operation: F) -> Result<T, AppError>
    where
        F: FnOnce(RequestContext) -> Fut,
        Fut: Future<Output = Result<T, AppError>>,
    {
        self.run(&mut ctx)?;
        operation(ctx).await
    }
}

/// Guard
///
/// Per-route middleware state: the chain protecting that route.
#[derive(Clone, Debug)]
pub struct Guard {
    chain: Arc<AuthChain>,
}

impl Guard {
    pub fn new(chain: AuthChain) -> Self {
        Self {
            chain: Arc::new(chain),
        }
    }

    /// Authenticate + `rule`, reading the target subject from `subject`.
    pub fn rule(state: &AppState, rule: Rule, subject: SubjectSource) -> Self {
        Self::new(AuthChain::protect(
            state.verifier.clone(),
            state.policy.clone(),
            rule,
            subject,
        ))
    }
}

/// guard
///
/// axum adapter for `AuthChain`. Use as a `route_layer` so path parameters
/// are already matched. On success the identity is placed in the request
/// extensions for the `VerifiedIdentity` extractor.
pub async fn guard(State(guard): State<Guard>, request: Request, next: Next) -> Response {
    let (mut parts, body) = request.into_parts();

    let path_params = match RawPathParams::from_request_parts(&mut parts, &()).await {
        Ok(params) => params
            .iter()
            .map(|(name, value)| (name.to_string(), value.to_string()))
            .collect(),
        Err(_) => HashMap::new(),
    };
    let mut ctx = RequestContext::from_parts(&parts.headers, path_params);

    if let Err(err) = guard.chain.run(&mut ctx) {
        return err.into_response();
    }

    if let Some(identity) = ctx.identity {
        parts.extensions.insert(identity);
    }
    next.run(Request::from_parts(parts, body)).await
}

impl<S> FromRequestParts<S> for VerifiedIdentity
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<VerifiedIdentity>()
            .cloned()
            .ok_or_else(|| AuthFailure::MissingToken.into())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use axum::http::{HeaderValue, StatusCode};
    use chrono::Duration;
    use jsonwebtoken::Algorithm;

    use super::*;
    use crate::{
        error::classify,
        keystore::tests::fixture_store,
        token::TokenIssuer,
        verify::RejectionReason,
    };

    const ISSUER: &str = "service project";

    struct Fixture {
        issuer: TokenIssuer,
        verifier: Arc<TokenVerifier>,
        policy: Arc<PolicyEvaluator>,
    }

    fn fixture() -> Fixture {
        let keys = Arc::new(fixture_store());
        Fixture {
            issuer: TokenIssuer::new(keys.clone()),
            verifier: Arc::new(TokenVerifier::new(keys, ISSUER, vec![Algorithm::RS256])),
            policy: Arc::new(PolicyEvaluator::new()),
        }
    }

    impl Fixture {
        fn token(&self, subject: &str, roles: &[&str]) -> String {
            let roles: Vec<String> = roles.iter().map(|r| r.to_string()).collect();
            self.issuer
                .issue(subject, ISSUER, &roles, "k1", Duration::hours(1))
                .unwrap()
        }

        fn chain(&self, rule: Rule) -> AuthChain {
            AuthChain::protect(
                self.verifier.clone(),
                self.policy.clone(),
                rule,
                SubjectSource::PathParam("user_id"),
            )
        }
    }

    fn status_of(err: &AppError) -> StatusCode {
        classify(err).unwrap().0
    }

    #[test]
    fn bearer_token_parsing() {
        let mut headers = HeaderMap::new();
        assert_eq!(bearer_token(&headers), None);

        for (value, expected) in [
            ("Bearer abc", Some("abc")),
            ("bearer abc", Some("abc")),
            ("Basic abc", None),
            ("Bearer ", None),
            ("Bearerabc", None),
        ] {
            headers.insert(header::AUTHORIZATION, HeaderValue::from_static(value));
            assert_eq!(bearer_token(&headers), expected, "{value:?}");
        }
    }

    #[test]
    fn authenticate_without_token_stops() {
        let f = fixture();
        let mut ctx = RequestContext::default();

        let err = Authenticate::new(f.verifier.clone()).run(&mut ctx).unwrap_err();

        assert!(matches!(err, AppError::Auth(AuthFailure::MissingToken)));
        assert!(ctx.identity.is_none());
    }

    #[test]
    fn authenticate_records_identity() {
        let f = fixture();
        let mut ctx = RequestContext::default().with_bearer(f.token("u1", &["USER"]));

        Authenticate::new(f.verifier.clone()).run(&mut ctx).unwrap();

        assert_eq!(ctx.identity.unwrap().subject, "u1");
    }

    #[test]
    fn authenticate_surfaces_rejection_reason_internally() {
        let f = fixture();
        let mut ctx = RequestContext::default().with_bearer("not.a.token");

        let err = Authenticate::new(f.verifier.clone()).run(&mut ctx).unwrap_err();

        assert!(matches!(
            err,
            AppError::Auth(AuthFailure::Rejected(RejectionReason::Malformed(_)))
        ));
        assert_eq!(status_of(&err), StatusCode::UNAUTHORIZED);
    }

    #[test]
    fn authorize_without_identity_is_forbidden() {
        let f = fixture();
        let mut ctx = RequestContext::default();

        let err = Authorize::new(f.policy.clone(), Rule::AdminOnly)
            .run(&mut ctx)
            .unwrap_err();

        assert!(matches!(err, AppError::Auth(AuthFailure::MissingIdentity)));
        assert_eq!(status_of(&err), StatusCode::FORBIDDEN);
    }

    #[test]
    fn unknown_rule_name_refuses_everyone() {
        let f = fixture();
        let chain = AuthChain::new()
            .stage(Authenticate::new(f.verifier.clone()))
            .boxed_stage(Authorize::named(f.policy.clone(), "AdminOrAnyone"));
        let mut ctx = RequestContext::default().with_bearer(f.token("root", &["ADMIN"]));

        let err = chain.run(&mut ctx).unwrap_err();

        assert!(matches!(err, AppError::Auth(AuthFailure::Misconfigured(_))));
        assert_eq!(status_of(&err), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn user_token_is_forbidden_on_admin_only() {
        let f = fixture();
        let invoked = AtomicBool::new(false);
        let ctx = RequestContext::default().with_bearer(f.token("u1", &["USER"]));

        let result = f
            .chain(Rule::AdminOnly)
            .execute(ctx, |_| async {
                invoked.store(true, Ordering::SeqCst);
                Ok(())
            })
            .await;

        let err = result.unwrap_err();
        assert_eq!(status_of(&err), StatusCode::FORBIDDEN);
        assert!(!invoked.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn subject_passes_admin_or_subject() {
        let f = fixture();
        let ctx = RequestContext::default()
            .with_bearer(f.token("u1", &["USER"]))
            .with_path_param("user_id", "u1");

        let subject = f
            .chain(Rule::AdminOrSubject)
            .execute(ctx, |ctx| async move {
                Ok(ctx.identity.map(|identity| identity.subject))
            })
            .await
            .unwrap();

        assert_eq!(subject.as_deref(), Some("u1"));
    }

    #[tokio::test]
    async fn other_subject_is_forbidden_unless_admin() {
        let f = fixture();

        let ctx = RequestContext::default()
            .with_bearer(f.token("u1", &["USER"]))
            .with_path_param("user_id", "u2");
        let err = f
            .chain(Rule::AdminOrSubject)
            .execute(ctx, |_| async { Ok(()) })
            .await
            .unwrap_err();
        assert_eq!(status_of(&err), StatusCode::FORBIDDEN);

        let ctx = RequestContext::default()
            .with_bearer(f.token("root", &["ADMIN"]))
            .with_path_param("user_id", "u2");
        assert!(
            f.chain(Rule::AdminOrSubject)
                .execute(ctx, |_| async { Ok(()) })
                .await
                .is_ok()
        );
    }

    #[tokio::test]
    async fn operation_errors_flow_through() {
        let f = fixture();
        let ctx = RequestContext::default().with_bearer(f.token("root", &["ADMIN"]));

        let err = f
            .chain(Rule::AdminOnly)
            .execute(ctx, |_| async {
                Err::<(), _>(AppError::trusted(StatusCode::NOT_FOUND, "user not found"))
            })
            .await
            .unwrap_err();

        assert_eq!(
            classify(&err).unwrap(),
            (
                StatusCode::NOT_FOUND,
                crate::error::ErrorResponse {
                    error: "user not found".into()
                }
            )
        );
    }

    #[test]
    fn custom_subject_hook() {
        let f = fixture();
        let hook = SubjectSource::Custom(Arc::new(|ctx: &RequestContext| {
            ctx.path_params.get("owner").map(|owner| owner.to_uppercase())
        }));
        let chain = AuthChain::protect(f.verifier.clone(), f.policy.clone(), Rule::AdminOrSubject, hook);
        let mut ctx = RequestContext::default()
            .with_bearer(f.token("U7", &[]))
            .with_path_param("owner", "u7");

        assert!(chain.run(&mut ctx).is_ok());
    }
}
