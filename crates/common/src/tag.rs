use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Zero-width space; cannot appear at the edge of a trimmed tag name.
pub const TAG_ID_SEPARATOR: &str = "\u{200b}";

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tag {
    pub id: String,
    pub name: String,
    pub value: String,
}

impl Tag {
    pub fn new(name: &str, value: &str) -> Self {
        let name = name.to_lowercase();
        let mut key = String::with_capacity(name.len() + value.len() + TAG_ID_SEPARATOR.len());
        key.push_str(&name);
        key.push_str(TAG_ID_SEPARATOR);
        key.push_str(&value.to_lowercase());
        Self {
            id: crate::stable_id(&key),
            name,
            value: value.to_string(),
        }
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.name, self.value)
    }
}

/// Tag values keyed by lowercase tag name.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tags(BTreeMap<String, Vec<String>>);

impl Tags {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, name: &str, value: impl Into<String>) {
        let value = value.into();
        if value.trim().is_empty() {
            return;
        }
        self.0.entry(name.to_lowercase()).or_default().push(value);
    }

    pub fn values(&self, name: &str) -> &[String] {
        self.0
            .get(&name.to_lowercase())
            .map(|values| values.as_slice())
            .unwrap_or(&[])
    }

    pub fn first(&self, name: &str) -> Option<&str> {
        self.values(name).first().map(|value| value.as_str())
    }

    pub fn flatten_all(&self) -> Vec<Tag> {
        let mut out = Vec::new();
        for (name, values) in &self.0 {
            for value in values {
                out.push(Tag::new(name, value));
            }
        }
        out
    }
}

impl FromIterator<(String, String)> for Tags {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        let mut tags = Tags::new();
        for (name, value) in iter {
            tags.add(&name, value);
        }
        tags
    }
}

#[cfg(test)]
mod tests {
    use super::{Tag, Tags};

    #[test]
    fn tag_id_ignores_case() {
        assert_eq!(Tag::new("Genre", "Rock").id, Tag::new("genre", "rock").id);
        assert_ne!(Tag::new("genre", "rock").id, Tag::new("mood", "rock").id);
    }

    #[test]
    fn tag_keeps_value_case_and_lowercases_name() {
        let tag = Tag::new("Genre", "Rock");
        assert_eq!(tag.name, "genre");
        assert_eq!(tag.value, "Rock");
        assert_eq!(tag.to_string(), "genre=Rock");
    }

    #[test]
    fn separator_keeps_name_value_split_unambiguous() {
        assert_ne!(Tag::new("ab", "c").id, Tag::new("a", "bc").id);
    }

    #[test]
    fn flatten_all_emits_every_value() {
        let mut tags = Tags::new();
        tags.add("genre", "Rock");
        tags.add("Genre", "Pop");
        tags.add("mood", "Happy");
        tags.add("mood", "  ");
        let flat = tags.flatten_all();
        assert_eq!(flat.len(), 3);
        assert_eq!(tags.values("GENRE"), ["Rock".to_string(), "Pop".to_string()]);
        assert!(flat.iter().any(|tag| tag.name == "mood" && tag.value == "Happy"));
    }
}
