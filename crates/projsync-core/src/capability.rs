use projsync_protocol::{EntityKind, Operation};

/// Injected view/mutate policy. The engine only asks; it never decides.
///
/// Any `Fn(EntityKind, &str) -> bool` works as a view-only policy that allows
/// every mutation.
pub trait Capabilities: Send + Sync {
    fn can_view(&self, kind: EntityKind, parent_id: &str) -> bool;

    fn can_mutate(&self, _operation: Operation) -> bool {
        true
    }
}

impl<F> Capabilities for F
where
    F: Fn(EntityKind, &str) -> bool + Send + Sync,
{
    fn can_view(&self, kind: EntityKind, parent_id: &str) -> bool {
        self(kind, parent_id)
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct AllowAll;

impl Capabilities for AllowAll {
    fn can_view(&self, _kind: EntityKind, _parent_id: &str) -> bool {
        true
    }
}

/// Allows viewing everything and denies a fixed set of operations.
#[derive(Clone, Debug, Default)]
pub struct DenyOperations(pub Vec<Operation>);

impl Capabilities for DenyOperations {
    fn can_view(&self, _kind: EntityKind, _parent_id: &str) -> bool {
        true
    }

    fn can_mutate(&self, operation: Operation) -> bool {
        !self.0.contains(&operation)
    }
}
