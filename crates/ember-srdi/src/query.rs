//! Query callbacks between the coordinator and the service answering
//! resolver queries.

use bytes::Bytes;
use ember_core::PeerId;
use ember_proto::{ResolverQuery, ResolverResponse};

/// Answers resolver queries addressed to one handler name.
pub trait QueryHandler: Send + Sync {
    /// Answers `query` from local knowledge. `None` passes it on.
    fn process_query(&self, query: &ResolverQuery) -> Option<Bytes>;

    /// The `(pk, attr, value)` triple an unanswered query looks for. With
    /// one, the query is routed towards the peers advertising it instead of
    /// being forwarded across the view.
    fn route_key(&self, _query: &ResolverQuery) -> Option<(String, String, String)> {
        None
    }

    /// Receives the answer to a query this peer originated.
    fn process_response(&self, from: PeerId, response: ResolverResponse);
}
