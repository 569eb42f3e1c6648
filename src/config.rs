//! Configuration for handle tables

/// The configuration of a [HandleTable](crate::HandleTable).
///
/// Every table in a [HandleStore](crate::HandleStore) shares the same configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde1", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde1", serde(default))]
pub struct HandleTableConfig {
    /// The maximum number of segments a single table may allocate.
    ///
    /// Allocations past this limit come back short.
    pub max_segments: Option<usize>,
    /// The number of out-of-order block insertions or removals
    /// a segment tolerates before it is resorted eagerly,
    /// instead of waiting for the next maintenance pass.
    pub resort_threshold: u32,
    /// Decommit pages past the last used block during maintenance
    pub trim_pages: bool,
    /// Release segments without any allocated blocks during maintenance
    pub reclaim_empty_segments: bool,
    /// Panic when an invariant violation is detected
    /// (a double free or a foreign handle),
    /// instead of logging it and carrying on.
    pub strict_assertions: bool,
    /// Ask the collector to verify referents belong to the scanning heap
    /// when tracing roots
    pub verify_heap: bool,
}
impl Default for HandleTableConfig {
    fn default() -> Self {
        HandleTableConfig {
            max_segments: None,
            resort_threshold: 32,
            trim_pages: true,
            reclaim_empty_segments: true,
            strict_assertions: cfg!(debug_assertions),
            verify_heap: false,
        }
    }
}
