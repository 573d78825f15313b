//! Subscription filters and the builder that merges command-line attributes into them.
//!
//! A [`Filter`] is the NIP-01 query object sent in a `REQ`. [`FilterBuilder`] takes an
//! optional base filter (usually one line of piped JSON) and applies a fixed set of
//! [`FilterOverrides`] on top of it, producing one canonical filter per input line.

use indexmap::IndexMap;
use serde::ser::{Serialize, SerializeMap, Serializer};
use serde_json::{Map, Value};
use std::fmt;
use thiserror::Error;

/// Errors that can occur while building a filter.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FilterError {
    #[error("invalid tag '{0}': expected a single-character key, like t=value")]
    InvalidTag(String),

    #[error("invalid filter '{input}': {reason}")]
    InvalidJson { input: String, reason: String },
}

impl FilterError {
    fn invalid_json(input: &str, reason: impl Into<String>) -> Self {
        FilterError::InvalidJson {
            input: input.to_string(),
            reason: reason.into(),
        }
    }
}

/// Filter for subscription requests.
///
/// `limit` is never `Some(0)`: an explicit zero limit is carried by `limit_zero` and
/// serialized as `"limit":0`, while an unset limit is omitted from the wire.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Filter {
    /// Event IDs
    pub ids: Vec<String>,
    /// Authors (pubkeys)
    pub authors: Vec<String>,
    /// Event kinds
    pub kinds: Vec<u16>,
    /// Generic tag queries, keyed by the single tag letter, in encounter order
    pub tags: IndexMap<char, Vec<String>>,
    /// Events since timestamp
    pub since: Option<u64>,
    /// Events until timestamp
    pub until: Option<u64>,
    /// Maximum number of events
    pub limit: Option<u64>,
    /// An explicit `"limit":0`
    pub limit_zero: bool,
    /// NIP-50 search query
    pub search: Option<String>,
}

impl Filter {
    /// Create a new empty filter.
    pub fn new() -> Self {
        Self::default()
    }

    /// Filter by event IDs.
    pub fn ids(mut self, ids: Vec<String>) -> Self {
        self.ids = ids;
        self
    }

    /// Filter by authors.
    pub fn authors(mut self, authors: Vec<String>) -> Self {
        self.authors = authors;
        self
    }

    /// Filter by kinds.
    pub fn kinds(mut self, kinds: Vec<u16>) -> Self {
        self.kinds = kinds;
        self
    }

    /// Filter by events since timestamp.
    pub fn since(mut self, timestamp: u64) -> Self {
        self.since = Some(timestamp);
        self
    }

    /// Filter by events until timestamp.
    pub fn until(mut self, timestamp: u64) -> Self {
        self.until = Some(timestamp);
        self
    }

    /// Limit number of results. Zero is kept as an explicit zero limit.
    pub fn limit(mut self, n: u64) -> Self {
        self.set_limit(n);
        self
    }

    /// Add a tag filter for the tag letter `key`.
    pub fn tag(mut self, key: char, values: Vec<String>) -> Self {
        self.tags.entry(key).or_default().extend(values);
        self
    }

    /// Filter by #e (event reference) tags.
    pub fn event_refs(self, event_ids: Vec<String>) -> Self {
        self.tag('e', event_ids)
    }

    /// Filter by #p (pubkey reference) tags.
    pub fn pubkey_refs(self, pubkeys: Vec<String>) -> Self {
        self.tag('p', pubkeys)
    }

    fn set_limit(&mut self, n: u64) {
        if n == 0 {
            self.limit = None;
            self.limit_zero = true;
        } else {
            self.limit = Some(n);
            self.limit_zero = false;
        }
    }

    /// Parse a filter from a JSON object.
    ///
    /// Unknown fields are ignored; `null` values count as absent. Tag keys must be
    /// `#` followed by exactly one character.
    pub fn from_json(input: &str) -> Result<Self, FilterError> {
        let value: Value =
            serde_json::from_str(input).map_err(|e| FilterError::invalid_json(input, e.to_string()))?;
        let Value::Object(object) = value else {
            return Err(FilterError::invalid_json(input, "expected a JSON object"));
        };
        Self::from_object(input, &object)
    }

    fn from_object(input: &str, object: &Map<String, Value>) -> Result<Self, FilterError> {
        let mut filter = Filter::default();

        for (key, value) in object {
            if value.is_null() {
                continue;
            }
            match key.as_str() {
                "ids" => filter.ids = string_list(input, key, value)?,
                "authors" => filter.authors = string_list(input, key, value)?,
                "kinds" => {
                    let kinds = value
                        .as_array()
                        .ok_or_else(|| FilterError::invalid_json(input, "kinds must be an array"))?;
                    filter.kinds = kinds
                        .iter()
                        .map(|k| {
                            k.as_u64()
                                .and_then(|k| u16::try_from(k).ok())
                                .ok_or_else(|| FilterError::invalid_json(input, format!("invalid kind {}", k)))
                        })
                        .collect::<Result<_, _>>()?;
                }
                "since" => filter.since = Some(number(input, key, value)?),
                "until" => filter.until = Some(number(input, key, value)?),
                "limit" => filter.set_limit(number(input, key, value)?),
                "search" => {
                    let search = value
                        .as_str()
                        .ok_or_else(|| FilterError::invalid_json(input, "search must be a string"))?;
                    filter.search = Some(search.to_string());
                }
                tag if tag.starts_with('#') => {
                    let tag_key = single_char(&tag[1..]).ok_or_else(|| FilterError::InvalidTag(tag.to_string()))?;
                    let values = string_list(input, key, value)?;
                    filter.tags.entry(tag_key).or_default().extend(values);
                }
                _ => {}
            }
        }

        Ok(filter)
    }
}

fn single_char(s: &str) -> Option<char> {
    let mut chars = s.chars();
    match (chars.next(), chars.next()) {
        (Some(c), None) => Some(c),
        _ => None,
    }
}

fn string_list(input: &str, key: &str, value: &Value) -> Result<Vec<String>, FilterError> {
    let items = value
        .as_array()
        .ok_or_else(|| FilterError::invalid_json(input, format!("{} must be an array", key)))?;
    items
        .iter()
        .map(|item| {
            item.as_str()
                .map(str::to_string)
                .ok_or_else(|| FilterError::invalid_json(input, format!("{} must contain strings", key)))
        })
        .collect()
}

fn number(input: &str, key: &str, value: &Value) -> Result<u64, FilterError> {
    value
        .as_u64()
        .ok_or_else(|| FilterError::invalid_json(input, format!("{} must be a non-negative integer", key)))
}

fn is_valid_tag_key(key: char) -> bool {
    !key.is_whitespace() && !key.is_control()
}

impl Serialize for Filter {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(None)?;
        if !self.ids.is_empty() {
            map.serialize_entry("ids", &self.ids)?;
        }
        if !self.authors.is_empty() {
            map.serialize_entry("authors", &self.authors)?;
        }
        if !self.kinds.is_empty() {
            map.serialize_entry("kinds", &self.kinds)?;
        }
        for (key, values) in &self.tags {
            if !values.is_empty() {
                map.serialize_entry(&format!("#{}", key), values)?;
            }
        }
        if let Some(since) = self.since {
            map.serialize_entry("since", &since)?;
        }
        if let Some(until) = self.until {
            map.serialize_entry("until", &until)?;
        }
        if let Some(limit) = self.limit {
            map.serialize_entry("limit", &limit)?;
        } else if self.limit_zero {
            map.serialize_entry("limit", &0)?;
        }
        if let Some(search) = &self.search {
            map.serialize_entry("search", search)?;
        }
        map.end()
    }
}

impl fmt::Display for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let json = serde_json::to_string(self).map_err(|_| fmt::Error)?;
        f.write_str(&json)
    }
}

/// Filter attributes supplied on the command line, applied to every input line.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FilterOverrides {
    pub ids: Vec<String>,
    pub authors: Vec<String>,
    pub kinds: Vec<u16>,
    /// `(key, value)` pairs in encounter order.
    pub tags: Vec<(char, String)>,
    pub since: Option<u64>,
    pub until: Option<u64>,
    pub limit: Option<u64>,
    pub search: Option<String>,
}

impl FilterOverrides {
    /// Add tag overrides in their canonical order: generic `key=value` flags first,
    /// then the `e`, `p` and `d` shortcuts.
    pub fn add_tags(
        &mut self,
        tag_flags: &[String],
        e: &[String],
        p: &[String],
        d: &[String],
    ) -> Result<(), FilterError> {
        for flag in tag_flags {
            self.tags.push(parse_tag_flag(flag)?);
        }
        self.tags.extend(e.iter().map(|v| ('e', v.clone())));
        self.tags.extend(p.iter().map(|v| ('p', v.clone())));
        self.tags.extend(d.iter().map(|v| ('d', v.clone())));
        Ok(())
    }
}

/// Parse a `key=value` tag flag. The key must be a single character and the value
/// may not contain another `=`.
pub fn parse_tag_flag(flag: &str) -> Result<(char, String), FilterError> {
    let parts: Vec<&str> = flag.split('=').collect();
    match parts.as_slice() {
        [key, value] => match single_char(key) {
            Some(key) if is_valid_tag_key(key) => Ok((key, value.to_string())),
            _ => Err(FilterError::InvalidTag(flag.to_string())),
        },
        _ => Err(FilterError::InvalidTag(flag.to_string())),
    }
}

/// Merges [`FilterOverrides`] into base filters.
#[derive(Debug, Clone, Default)]
pub struct FilterBuilder {
    overrides: FilterOverrides,
}

impl FilterBuilder {
    pub fn new(overrides: FilterOverrides) -> Self {
        Self { overrides }
    }

    pub fn overrides(&self) -> &FilterOverrides {
        &self.overrides
    }

    /// Build the canonical filter from an optional base.
    ///
    /// List attributes append to the base lists, tag values append after the base
    /// values of the same key, and `since`/`until`/`limit`/`search` replace the base.
    pub fn build(&self, base: Option<Filter>) -> Result<Filter, FilterError> {
        let o = &self.overrides;
        let mut filter = base.unwrap_or_default();

        if let Some(key) = filter.tags.keys().find(|k| !is_valid_tag_key(**k)) {
            return Err(FilterError::InvalidTag(format!("#{}", key)));
        }

        filter.authors.extend(o.authors.iter().cloned());
        filter.ids.extend(o.ids.iter().cloned());
        filter.kinds.extend(o.kinds.iter().copied());

        for (key, value) in &o.tags {
            if !is_valid_tag_key(*key) {
                return Err(FilterError::InvalidTag(format!("{}={}", key, value)));
            }
            filter.tags.entry(*key).or_default().push(value.clone());
        }

        if let Some(since) = o.since {
            filter.since = Some(since);
        }
        if let Some(until) = o.until {
            filter.until = Some(until);
        }
        if let Some(limit) = o.limit {
            filter.set_limit(limit);
        }
        if let Some(search) = &o.search {
            filter.search = Some(search.clone());
        }

        Ok(filter)
    }

    /// Build from one input line: blank lines start from an empty filter, anything
    /// else must be a filter JSON object.
    pub fn build_line(&self, line: &str) -> Result<Filter, FilterError> {
        let line = line.trim();
        if line.is_empty() {
            self.build(None)
        } else {
            self.build(Some(Filter::from_json(line)?))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(values: &[&str]) -> Vec<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    #[test]
    fn test_build_appends_lists() {
        let base = Filter::new()
            .kinds(vec![1])
            .authors(strings(&["alice"]))
            .ids(strings(&["id1"]));
        let builder = FilterBuilder::new(FilterOverrides {
            kinds: vec![4549],
            authors: strings(&["bob"]),
            ids: strings(&["id2"]),
            ..Default::default()
        });

        let filter = builder.build(Some(base)).unwrap();
        assert_eq!(filter.kinds, vec![1, 4549]);
        assert_eq!(filter.authors, strings(&["alice", "bob"]));
        assert_eq!(filter.ids, strings(&["id1", "id2"]));
    }

    #[test]
    fn test_tag_values_keep_insertion_order() {
        let mut overrides = FilterOverrides::default();
        overrides
            .add_tags(&strings(&["t=spam", "t=spam2"]), &[], &[], &[])
            .unwrap();
        let filter = FilterBuilder::new(overrides).build(None).unwrap();
        assert_eq!(filter.tags[&'t'], strings(&["spam", "spam2"]));
    }

    #[test]
    fn test_tag_encounter_order() {
        let mut overrides = FilterOverrides::default();
        overrides
            .add_tags(
                &strings(&["x=1"]),
                &strings(&["event"]),
                &strings(&["pubkey"]),
                &strings(&["ident"]),
            )
            .unwrap();
        let base = Filter::from_json(r##"{"#t":["test"],"#e":["first"]}"##).unwrap();
        let filter = FilterBuilder::new(overrides).build(Some(base)).unwrap();

        let keys: Vec<char> = filter.tags.keys().copied().collect();
        assert_eq!(keys, vec!['t', 'e', 'x', 'p', 'd']);
        assert_eq!(filter.tags[&'e'], strings(&["first", "event"]));
        assert_eq!(
            filter.to_string(),
            r##"{"#t":["test"],"#e":["first","event"],"#x":["1"],"#p":["pubkey"],"#d":["ident"]}"##
        );
    }

    #[test]
    fn test_limit_zero_is_explicit() {
        let zero = FilterBuilder::new(FilterOverrides {
            limit: Some(0),
            ..Default::default()
        })
        .build(None)
        .unwrap();
        assert!(zero.limit_zero);
        assert_eq!(zero.limit, None);
        assert_eq!(zero.to_string(), r#"{"limit":0}"#);

        let five = FilterBuilder::new(FilterOverrides {
            limit: Some(5),
            ..Default::default()
        })
        .build(Some(zero))
        .unwrap();
        assert_eq!(five.limit, Some(5));
        assert!(!five.limit_zero);

        let unset = FilterBuilder::default().build(None).unwrap();
        assert_eq!(unset.limit, None);
        assert!(!unset.limit_zero);
        assert_eq!(unset.to_string(), "{}");
    }

    #[test]
    fn test_scalar_overrides_replace_base() {
        let base = Filter::from_json(r#"{"since":1,"until":2,"search":"old","limit":3}"#).unwrap();
        let filter = FilterBuilder::new(FilterOverrides {
            since: Some(10),
            until: Some(20),
            search: Some("new".to_string()),
            ..Default::default()
        })
        .build(Some(base))
        .unwrap();
        assert_eq!(filter.since, Some(10));
        assert_eq!(filter.until, Some(20));
        assert_eq!(filter.search.as_deref(), Some("new"));
        assert_eq!(filter.limit, Some(3));
    }

    #[test]
    fn test_invalid_tag_flags() {
        assert!(matches!(parse_tag_flag("tt=x"), Err(FilterError::InvalidTag(_))));
        assert!(matches!(parse_tag_flag("t=a=b"), Err(FilterError::InvalidTag(_))));
        assert!(matches!(parse_tag_flag("novalue"), Err(FilterError::InvalidTag(_))));
        assert!(matches!(parse_tag_flag(" =x"), Err(FilterError::InvalidTag(_))));
        assert_eq!(parse_tag_flag("t=").unwrap(), ('t', String::new()));

        let mut overrides = FilterOverrides::default();
        assert!(overrides.add_tags(&strings(&["t=ok", "bad"]), &[], &[], &[]).is_err());
    }

    #[test]
    fn test_base_tag_key_must_be_single_char() {
        let result = FilterBuilder::default().build_line(r##"{"#ab":["x"]}"##);
        assert!(matches!(result, Err(FilterError::InvalidTag(tag)) if tag == "#ab"));
    }

    #[test]
    fn test_build_line_rejects_bad_json() {
        let builder = FilterBuilder::default();
        assert!(matches!(
            builder.build_line("{not json"),
            Err(FilterError::InvalidJson { .. })
        ));
        assert!(matches!(
            builder.build_line("[1,2]"),
            Err(FilterError::InvalidJson { .. })
        ));
        assert!(matches!(
            builder.build_line(r#"{"kinds":[70000]}"#),
            Err(FilterError::InvalidJson { .. })
        ));
        assert_eq!(builder.build_line("   ").unwrap(), Filter::default());
    }

    #[test]
    fn test_from_json_ignores_unknown_and_null() {
        let filter =
            Filter::from_json(r#"{"kinds":[1,4549],"until":null,"relays":["x"],"limit":5}"#).unwrap();
        assert_eq!(filter.kinds, vec![1, 4549]);
        assert_eq!(filter.until, None);
        assert_eq!(filter.limit, Some(5));
    }

    #[test]
    fn test_serialization_field_order() {
        let filter = Filter::new()
            .kinds(vec![1])
            .authors(strings(&["a"]))
            .ids(strings(&["i"]))
            .since(5)
            .until(9)
            .limit(2)
            .pubkey_refs(strings(&["p1"]));
        assert_eq!(
            serde_json::to_string(&filter).unwrap(),
            r##"{"ids":["i"],"authors":["a"],"kinds":[1],"#p":["p1"],"since":5,"until":9,"limit":2}"##
        );
    }
}
