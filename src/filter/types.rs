//! Filter value objects.
//!
//! A [`Filter`] is the NIP-01 query a subscription sends to relays, with one
//! twist: `since` is kept per relay, because each relay independently reports
//! how much history it already delivered. The JSON sent to a relay carries
//! only that relay's checkpoint.

use std::collections::{BTreeMap, HashMap, HashSet};

use nostr::{Event, EventId, Kind, PublicKey, RelayUrl, Timestamp};
use serde_json::{Map, Value};

use super::FeedType;

/// Matching criteria for a subscription.
///
/// Every field is optional; an absent field matches anything.
///
/// # Example
///
/// ```
/// use nostr::{Kind, RelayUrl, Timestamp};
/// use relay_hub::filter::Filter;
///
/// let relay = RelayUrl::parse("wss://relay.example.com").unwrap();
/// let filter = Filter::new()
///     .kinds([Kind::TextNote])
///     .tag("t", ["rust"])
///     .since(&relay, Timestamp::from(1_700_000_000))
///     .limit(50);
///
/// let json = filter.to_json(&relay);
/// assert_eq!(json["kinds"][0], 1);
/// assert_eq!(json["#t"][0], "rust");
/// assert_eq!(json["since"], 1_700_000_000);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Filter {
    /// Event ids.
    pub ids: Option<Vec<EventId>>,
    /// Author public keys.
    pub authors: Option<Vec<PublicKey>>,
    /// Event kinds.
    pub kinds: Option<Vec<Kind>>,
    /// Tag filters keyed by tag name (without the `#` prefix).
    pub tags: Option<BTreeMap<String, Vec<String>>>,
    /// Resumption checkpoint per relay.
    pub since: Option<HashMap<RelayUrl, Timestamp>>,
    /// Upper bound on `created_at`.
    pub until: Option<Timestamp>,
    /// Maximum number of stored events to return.
    pub limit: Option<usize>,
    /// NIP-50 search string.
    pub search: Option<String>,
}

impl Filter {
    /// Creates an empty filter that matches every event.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Restricts the filter to the given event ids.
    #[must_use]
    pub fn ids(mut self, ids: impl IntoIterator<Item = EventId>) -> Self {
        self.ids = Some(ids.into_iter().collect());
        self
    }

    /// Restricts the filter to the given authors.
    #[must_use]
    pub fn authors(mut self, authors: impl IntoIterator<Item = PublicKey>) -> Self {
        self.authors = Some(authors.into_iter().collect());
        self
    }

    /// Restricts the filter to the given kinds.
    #[must_use]
    pub fn kinds(mut self, kinds: impl IntoIterator<Item = Kind>) -> Self {
        self.kinds = Some(kinds.into_iter().collect());
        self
    }

    /// Adds a tag filter. `name` is the tag name without `#`.
    #[must_use]
    pub fn tag<S: Into<String>>(mut self, name: &str, values: impl IntoIterator<Item = S>) -> Self {
        self.tags
            .get_or_insert_with(BTreeMap::new)
            .insert(name.to_string(), values.into_iter().map(Into::into).collect());
        self
    }

    /// Sets the checkpoint for one relay.
    #[must_use]
    pub fn since(mut self, relay: &RelayUrl, timestamp: Timestamp) -> Self {
        self.since
            .get_or_insert_with(HashMap::new)
            .insert(relay.clone(), timestamp);
        self
    }

    /// Sets the upper time bound.
    #[must_use]
    pub const fn until(mut self, timestamp: Timestamp) -> Self {
        self.until = Some(timestamp);
        self
    }

    /// Sets the stored-event limit.
    #[must_use]
    pub const fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Sets the search string.
    #[must_use]
    pub fn search(mut self, query: impl Into<String>) -> Self {
        self.search = Some(query.into());
        self
    }

    /// Returns the checkpoint for `relay`, if one was recorded.
    #[must_use]
    pub fn since_for(&self, relay: &RelayUrl) -> Option<Timestamp> {
        self.since.as_ref().and_then(|map| map.get(relay).copied())
    }

    /// Moves the checkpoint for `relay` forward.
    ///
    /// The stored value never decreases; an older timestamp is ignored.
    pub fn advance_since(&mut self, relay: &RelayUrl, timestamp: Timestamp) {
        let map = self.since.get_or_insert_with(HashMap::new);
        let entry = map.entry(relay.clone()).or_insert(timestamp);
        if timestamp > *entry {
            *entry = timestamp;
        }
    }

    /// Compares every field except `since`.
    ///
    /// Two filters that only differ in their checkpoints ask for the same
    /// events; re-sending them would just churn the relay subscription.
    #[must_use]
    pub fn same_query_as(&self, other: &Self) -> bool {
        self.ids == other.ids
            && self.authors == other.authors
            && self.kinds == other.kinds
            && self.tags == other.tags
            && self.until == other.until
            && self.limit == other.limit
            && self.search == other.search
    }

    /// Re-checks a delivered event against this filter.
    ///
    /// Relays are untrusted: they may deliver events that do not match the
    /// subscription. `search` is evaluated server-side and is not checked.
    #[must_use]
    pub fn matches(&self, event: &Event, relay: &RelayUrl) -> bool {
        if let Some(ids) = &self.ids {
            if !ids.contains(&event.id) {
                return false;
            }
        }

        if let Some(authors) = &self.authors {
            if !authors.contains(&event.pubkey) {
                return false;
            }
        }

        if let Some(kinds) = &self.kinds {
            if !kinds.contains(&event.kind) {
                return false;
            }
        }

        if let Some(tags) = &self.tags {
            for (name, values) in tags {
                let found = event.tags.iter().any(|tag| {
                    let parts = tag.as_slice();
                    parts.first().is_some_and(|n| n == name)
                        && parts.get(1).is_some_and(|v| values.contains(v))
                });
                if !found {
                    return false;
                }
            }
        }

        if let Some(since) = self.since_for(relay) {
            if event.created_at < since {
                return false;
            }
        }

        if let Some(until) = self.until {
            if event.created_at > until {
                return false;
            }
        }

        true
    }

    /// Serializes the filter as sent to `relay`.
    ///
    /// Only `relay`'s own checkpoint is included as `since`.
    #[must_use]
    pub fn to_json(&self, relay: &RelayUrl) -> Value {
        let mut obj = Map::new();

        if let Some(ids) = &self.ids {
            let ids: Vec<String> = ids.iter().map(EventId::to_hex).collect();
            obj.insert("ids".to_string(), Value::from(ids));
        }

        if let Some(authors) = &self.authors {
            let authors: Vec<String> = authors.iter().map(PublicKey::to_hex).collect();
            obj.insert("authors".to_string(), Value::from(authors));
        }

        if let Some(kinds) = &self.kinds {
            let kinds: Vec<u16> = kinds.iter().map(|k| k.as_u16()).collect();
            obj.insert("kinds".to_string(), Value::from(kinds));
        }

        if let Some(tags) = &self.tags {
            for (name, values) in tags {
                obj.insert(format!("#{name}"), Value::from(values.clone()));
            }
        }

        if let Some(since) = self.since_for(relay) {
            obj.insert("since".to_string(), Value::from(since.as_u64()));
        }

        if let Some(until) = self.until {
            obj.insert("until".to_string(), Value::from(until.as_u64()));
        }

        if let Some(limit) = self.limit {
            obj.insert("limit".to_string(), Value::from(limit));
        }

        if let Some(search) = &self.search {
            obj.insert("search".to_string(), Value::from(search.clone()));
        }

        Value::Object(obj)
    }
}

/// A [`Filter`] plus the feed types it is meant for.
///
/// Optionally restricted to an explicit set of relays, e.g. a reply fetch
/// directed at the relay a note was seen on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypedFilter {
    /// The query itself.
    pub filter: Filter,
    /// Feed types this filter is routed to.
    pub types: HashSet<FeedType>,
    /// When set, only these relays may receive the filter.
    pub relays: Option<HashSet<RelayUrl>>,
}

impl TypedFilter {
    /// Creates a typed filter routed by `types`.
    #[must_use]
    pub fn new(filter: Filter, types: impl IntoIterator<Item = FeedType>) -> Self {
        Self {
            filter,
            types: types.into_iter().collect(),
            relays: None,
        }
    }

    /// Restricts the filter to the given relays.
    #[must_use]
    pub fn only_for(mut self, relays: impl IntoIterator<Item = RelayUrl>) -> Self {
        self.relays = Some(relays.into_iter().collect());
        self
    }

    /// Whether the relay restriction admits `relay`.
    #[must_use]
    pub fn is_valid_for(&self, relay: &RelayUrl) -> bool {
        self.relays.as_ref().map_or(true, |set| set.contains(relay))
    }

    /// Whether a relay serving `feed_types` at `relay` should receive this filter.
    #[must_use]
    pub fn applies_to(&self, feed_types: &HashSet<FeedType>, relay: &RelayUrl) -> bool {
        !self.types.is_disjoint(feed_types) && self.is_valid_for(relay)
    }

    /// Compares routing and query, ignoring `since`.
    #[must_use]
    pub fn same_query_as(&self, other: &Self) -> bool {
        self.types == other.types
            && self.relays == other.relays
            && self.filter.same_query_as(&other.filter)
    }
}

#[cfg(test)]
mod tests {
    use nostr::{EventBuilder, Keys, Tag};

    use super::*;

    fn relay(url: &str) -> RelayUrl {
        RelayUrl::parse(url).unwrap()
    }

    fn note(keys: &Keys, created_at: u64, tags: Vec<Tag>) -> Event {
        EventBuilder::text_note("hello")
            .tags(tags)
            .custom_created_at(Timestamp::from(created_at))
            .sign_with_keys(keys)
            .unwrap()
    }

    #[test]
    fn empty_filter_matches_everything() {
        let keys = Keys::generate();
        let event = note(&keys, 100, vec![]);
        assert!(Filter::new().matches(&event, &relay("wss://a.example.com")));
    }

    #[test]
    fn since_is_projected_per_relay() {
        let a = relay("wss://a.example.com");
        let b = relay("wss://b.example.com");
        let filter = Filter::new()
            .since(&a, Timestamp::from(10))
            .since(&b, Timestamp::from(20));

        assert_eq!(filter.to_json(&a)["since"], 10);
        assert_eq!(filter.to_json(&b)["since"], 20);
        assert!(filter.to_json(&relay("wss://c.example.com")).get("since").is_none());
    }

    #[test]
    fn advance_since_never_goes_back() {
        let a = relay("wss://a.example.com");
        let mut filter = Filter::new();

        filter.advance_since(&a, Timestamp::from(50));
        filter.advance_since(&a, Timestamp::from(30));
        assert_eq!(filter.since_for(&a), Some(Timestamp::from(50)));

        filter.advance_since(&a, Timestamp::from(70));
        assert_eq!(filter.since_for(&a), Some(Timestamp::from(70)));
    }

    #[test]
    fn matches_checks_since_for_the_delivering_relay() {
        let keys = Keys::generate();
        let a = relay("wss://a.example.com");
        let b = relay("wss://b.example.com");
        let filter = Filter::new().since(&a, Timestamp::from(100));
        let event = note(&keys, 50, vec![]);

        assert!(!filter.matches(&event, &a));
        assert!(filter.matches(&event, &b));
    }

    #[test]
    fn matches_checks_until() {
        let keys = Keys::generate();
        let a = relay("wss://a.example.com");
        let filter = Filter::new().until(Timestamp::from(100));

        assert!(filter.matches(&note(&keys, 100, vec![]), &a));
        assert!(!filter.matches(&note(&keys, 101, vec![]), &a));
    }

    #[test]
    fn matches_requires_tag_pair() {
        let keys = Keys::generate();
        let a = relay("wss://a.example.com");
        let filter = Filter::new().tag("t", ["rust", "nostr"]);

        let tagged = note(&keys, 1, vec![Tag::parse(["t", "nostr"]).unwrap()]);
        let other = note(&keys, 1, vec![Tag::parse(["t", "java"]).unwrap()]);
        let wrong_name = note(&keys, 1, vec![Tag::parse(["p", "rust"]).unwrap()]);

        assert!(filter.matches(&tagged, &a));
        assert!(!filter.matches(&other, &a));
        assert!(!filter.matches(&wrong_name, &a));
    }

    #[test]
    fn matches_checks_ids_authors_kinds() {
        let keys = Keys::generate();
        let stranger = Keys::generate();
        let a = relay("wss://a.example.com");
        let event = note(&keys, 1, vec![]);

        assert!(Filter::new().ids([event.id]).matches(&event, &a));
        assert!(!Filter::new().ids([EventId::all_zeros()]).matches(&event, &a));
        assert!(Filter::new().authors([keys.public_key()]).matches(&event, &a));
        assert!(!Filter::new().authors([stranger.public_key()]).matches(&event, &a));
        assert!(Filter::new().kinds([Kind::TextNote]).matches(&event, &a));
        assert!(!Filter::new().kinds([Kind::Metadata]).matches(&event, &a));
    }

    #[test]
    fn to_json_writes_hex_and_tags() {
        let keys = Keys::generate();
        let a = relay("wss://a.example.com");
        let filter = Filter::new()
            .authors([keys.public_key()])
            .tag("e", ["abc"])
            .until(Timestamp::from(9))
            .limit(3)
            .search("coffee");

        let json = filter.to_json(&a);
        assert_eq!(json["authors"][0], keys.public_key().to_hex());
        assert_eq!(json["#e"][0], "abc");
        assert_eq!(json["until"], 9);
        assert_eq!(json["limit"], 3);
        assert_eq!(json["search"], "coffee");
        assert!(json.get("ids").is_none());
    }

    #[test]
    fn same_query_ignores_since() {
        let a = relay("wss://a.example.com");
        let base = Filter::new().kinds([Kind::TextNote]);
        let with_since = base.clone().since(&a, Timestamp::from(5));

        assert!(base.same_query_as(&with_since));
        assert_ne!(base, with_since);
        assert!(!base.same_query_as(&base.clone().limit(1)));
    }

    #[test]
    fn typed_filter_routing() {
        let a = relay("wss://a.example.com");
        let b = relay("wss://b.example.com");
        let global: HashSet<FeedType> = [FeedType::Global].into_iter().collect();

        let follows = TypedFilter::new(Filter::new(), [FeedType::Follows]);
        assert!(!follows.applies_to(&global, &a));

        let directed = TypedFilter::new(Filter::new(), [FeedType::Global]).only_for([a.clone()]);
        assert!(directed.applies_to(&global, &a));
        assert!(!directed.applies_to(&global, &b));
    }
}
