use std::fmt;
use std::sync::Arc;

use crate::fetch::FetchRequest;

/// Per-call knobs applied on top of a fetch request. The defaults match the
/// convenience entry points: subkind rows are included and unsaved changes
/// in the originating context are visible.
#[derive(Clone)]
pub struct FetchOptions {
    pub include_subkinds: bool,
    pub include_pending_changes: bool,
    pub ids_only: bool,
    pub properties_only: bool,
    pub distinct: bool,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
    pub batch_size: Option<usize>,
    pub prefetch: Vec<String>,
    /// Last-stage hook: runs after all other options are applied, so it can
    /// override anything on the assembled request.
    pub tweak: Option<Arc<dyn Fn(&mut FetchRequest) + Send + Sync>>,
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self {
            include_subkinds: true,
            include_pending_changes: true,
            ids_only: false,
            properties_only: false,
            distinct: false,
            limit: None,
            offset: None,
            batch_size: None,
            prefetch: Vec::new(),
            tweak: None,
        }
    }
}

impl fmt::Debug for FetchOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FetchOptions")
            .field("include_subkinds", &self.include_subkinds)
            .field("include_pending_changes", &self.include_pending_changes)
            .field("ids_only", &self.ids_only)
            .field("properties_only", &self.properties_only)
            .field("distinct", &self.distinct)
            .field("limit", &self.limit)
            .field("offset", &self.offset)
            .field("batch_size", &self.batch_size)
            .field("prefetch", &self.prefetch)
            .field("tweak", &self.tweak.as_ref().map(|_| "<fn>"))
            .finish()
    }
}

impl FetchOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Restrict results to the exact entity, skipping subkind rows.
    pub fn exclude_subkinds(mut self) -> Self {
        self.include_subkinds = false;
        self
    }

    /// Only consider rows already committed to the originating context.
    pub fn exclude_pending_changes(mut self) -> Self {
        self.include_pending_changes = false;
        self
    }

    pub fn ids_only(mut self) -> Self {
        self.ids_only = true;
        self
    }

    pub fn properties_only(mut self) -> Self {
        self.properties_only = true;
        self
    }

    pub fn distinct(mut self) -> Self {
        self.distinct = true;
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn offset(mut self, offset: usize) -> Self {
        self.offset = Some(offset);
        self
    }

    pub fn batch_size(mut self, size: usize) -> Self {
        self.batch_size = Some(size);
        self
    }

    pub fn prefetch(mut self, key_path: impl Into<String>) -> Self {
        self.prefetch.push(key_path.into());
        self
    }

    pub fn tweak(mut self, f: impl Fn(&mut FetchRequest) + Send + Sync + 'static) -> Self {
        self.tweak = Some(Arc::new(f));
        self
    }
}
