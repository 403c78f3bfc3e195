mod query;
mod retriever;

pub use query::{Direction, FindSymbolRequest, KgNodeProps, KgQueryService, NeighborRow, RelType};
pub use retriever::{CandidateRetriever, CandidateStats, KgCandidate, KgCandidateResult};
