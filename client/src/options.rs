#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortDirection {
    Asc,
    Desc,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderBy {
    pub field: String,
    pub direction: SortDirection,
}

impl OrderBy {
    pub fn asc(field: impl Into<String>) -> Self { Self { field: field.into(), direction: SortDirection::Asc } }

    pub fn desc(field: impl Into<String>) -> Self { Self { field: field.into(), direction: SortDirection::Desc } }
}

/// How the snapshot is materialized from the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionMode {
    /// Only cached items appear; server-pushed items with unknown ids are
    /// ignored. Default when `limit` is set.
    Strict,
    /// Cache sorted by `order_by`; server-pushed items are included.
    Sorted,
    /// Cached items in sort order, then items observed after initial load
    /// in arrival order.
    Append,
    /// Newest-observed items first, then the sorted cache.
    Prepend,
    /// All observed items sorted; strict caching off. Default without
    /// `limit`.
    Live,
}

#[derive(Debug, Clone)]
pub struct LiveQueryOptions {
    pub resource: String,
    pub filter: Option<String>,
    /// Relation names to include on delivered objects.
    pub include: Vec<String>,
    pub order_by: Vec<OrderBy>,
    pub limit: Option<usize>,
    pub mode: Option<SubscriptionMode>,
    pub id_field: String,
}

impl LiveQueryOptions {
    pub fn new(resource: impl Into<String>) -> Self {
        Self {
            resource: resource.into(),
            filter: None,
            include: Vec::new(),
            order_by: Vec::new(),
            limit: None,
            mode: None,
            id_field: "id".to_string(),
        }
    }

    pub fn filter(mut self, filter: impl Into<String>) -> Self {
        self.filter = Some(filter.into());
        self
    }

    pub fn include(mut self, relation: impl Into<String>) -> Self {
        self.include.push(relation.into());
        self
    }

    pub fn order_by(mut self, order: OrderBy) -> Self {
        self.order_by.push(order);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn mode(mut self, mode: SubscriptionMode) -> Self {
        self.mode = Some(mode);
        self
    }

    /// `strict` when a limit is set, `live` otherwise, unless overridden.
    pub fn resolved_mode(&self) -> SubscriptionMode {
        self.mode.unwrap_or(if self.limit.is_some() { SubscriptionMode::Strict } else { SubscriptionMode::Live })
    }
}
