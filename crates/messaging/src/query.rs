use eventweave_core::QueryId;

/// A read-only request routed to exactly one projection.
///
/// Queries carry no target aggregate id; they are routed solely by payload
/// type, to whichever projection registered a handler for that type. By
/// contract a query handler has no side effects.
pub trait Query: Clone + core::fmt::Debug + Send + Sync + 'static {
    /// The declared response type for this query.
    type Response: Send + 'static;

    /// A unique id for this query instance.
    fn query_id(&self) -> QueryId {
        QueryId::new()
    }
}
