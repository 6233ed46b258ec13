use crate::Seq;

/// Options a client sends when opening a subscription, conveyed as query
/// parameters (or equivalent) by the transport layer.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SubscribeOptions {
    /// Filter DSL source string.
    pub filter: Option<String>,
    /// Relation names to include on delivered objects.
    pub include: Vec<String>,
    /// Last sequence seen; presence signals a reconnect wanting catch-up.
    pub resume_from: Option<Seq>,
    /// Omit the initial `existing` snapshot entirely.
    pub skip_existing: bool,
    /// Ids the client already holds; the server may skip `existing` for them.
    pub known_ids: Vec<String>,
}

impl SubscribeOptions {
    pub fn new() -> Self { Self::default() }

    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        self.filter = Some(filter.into());
        self
    }

    pub fn resume_from(mut self, seq: Seq) -> Self {
        self.resume_from = Some(seq);
        self
    }

    /// Serialize to transport query pairs.
    pub fn to_query_pairs(&self) -> Vec<(&'static str, String)> {
        let mut pairs = Vec::new();
        if let Some(filter) = &self.filter {
            pairs.push(("filter", filter.clone()));
        }
        if !self.include.is_empty() {
            pairs.push(("include", self.include.join(",")));
        }
        if let Some(seq) = self.resume_from {
            pairs.push(("resumeFrom", seq.to_string()));
        }
        if self.skip_existing {
            pairs.push(("skipExisting", "true".to_string()));
        }
        if !self.known_ids.is_empty() {
            pairs.push(("knownIds", self.known_ids.join(",")));
        }
        pairs
    }

    /// Parse from transport query pairs. Unknown keys are ignored.
    pub fn from_query_pairs<'a>(pairs: impl IntoIterator<Item = (&'a str, &'a str)>) -> Self {
        let mut options = Self::default();
        for (key, value) in pairs {
            match key {
                "filter" => options.filter = Some(value.to_string()),
                "include" => options.include = split_csv(value),
                "resumeFrom" => options.resume_from = value.parse().ok(),
                "skipExisting" => options.skip_existing = value == "true" || value == "1",
                "knownIds" => options.known_ids = split_csv(value),
                _ => {}
            }
        }
        options
    }
}

fn split_csv(value: &str) -> Vec<String> {
    value.split(',').map(str::trim).filter(|s| !s.is_empty()).map(str::to_string).collect()
}
