use tokio_util::sync::CancellationToken;

/// Request-scoped values that travel with a scan: cancellation plus who asked.
#[derive(Clone, Debug, Default)]
pub struct RequestContext {
    cancel: CancellationToken,
    user: Option<String>,
    broadcast_to_all: bool,
}

impl RequestContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Copies the request values onto a child of `root`, addressed to every subscriber.
    pub fn derive(&self, root: &CancellationToken) -> Self {
        Self {
            cancel: root.child_token(),
            user: self.user.clone(),
            broadcast_to_all: true,
        }
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn user(&self) -> Option<&str> {
        self.user.as_deref()
    }

    pub fn broadcast_to_all(&self) -> bool {
        self.broadcast_to_all
    }
}

#[cfg(test)]
mod tests {
    use super::RequestContext;
    use tokio_util::sync::CancellationToken;

    #[test]
    fn derived_context_follows_root_not_caller() {
        let root = CancellationToken::new();
        let caller = RequestContext::new().with_user("admin");
        let derived = caller.derive(&root);

        assert_eq!(derived.user(), Some("admin"));
        assert!(derived.broadcast_to_all());
        assert!(!caller.broadcast_to_all());

        caller.cancellation().cancel();
        assert!(!derived.is_cancelled());
        root.cancel();
        assert!(derived.is_cancelled());
    }
}
