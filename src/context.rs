use tracing::Span;

/// Per-request logging context. Created once when the correlation id is known
/// and passed down to every component handling the request.
#[derive(Clone, Debug)]
pub struct RequestContext {
    pub correlation_id: String,
    pub requester: Option<String>,
    pub location: Option<String>,
    span: Span,
}

impl RequestContext {
    pub fn builder(correlation_id: impl Into<String>) -> RequestContextBuilder {
        RequestContextBuilder {
            correlation_id: correlation_id.into(),
            requester: None,
            location: None,
            component: "receiver",
        }
    }

    pub fn span(&self) -> &Span {
        &self.span
    }
}

pub struct RequestContextBuilder {
    correlation_id: String,
    requester: Option<String>,
    location: Option<String>,
    component: &'static str,
}

impl RequestContextBuilder {
    pub fn requester(mut self, requester: impl Into<String>) -> Self {
        self.requester = Some(requester.into());
        self
    }

    pub fn location(mut self, location: impl Into<String>) -> Self {
        self.location = Some(location.into());
        self
    }

    pub fn component(mut self, component: &'static str) -> Self {
        self.component = component;
        self
    }

    pub fn build(self) -> RequestContext {
        let span = tracing::info_span!(
            "request",
            component = self.component,
            correlation_id = %self.correlation_id,
            requester = tracing::field::Empty,
        );
        if let Some(ref requester) = self.requester {
            span.record("requester", requester.as_str());
        }
        RequestContext {
            correlation_id: self.correlation_id,
            requester: self.requester,
            location: self.location,
            span,
        }
    }
}
