use std::{collections::BTreeMap, fmt};

pub const SOURCE_K8S: &str = "k8s";
pub const SOURCE_UNSPEC: &str = "unspec";

/// A single security-relevant label.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Label {
    pub source: String,
    pub key: String,
    pub value: String,
}

/// A label set holding at most one label per key, ordered by key.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct Labels(BTreeMap<String, Label>);

// === impl Label ===

impl Label {
    pub fn new(source: impl ToString, key: impl ToString, value: impl ToString) -> Self {
        Self {
            source: source.to_string(),
            key: key.to_string(),
            value: value.to_string(),
        }
    }

    pub fn k8s(key: impl ToString, value: impl ToString) -> Self {
        Self::new(SOURCE_K8S, key, value)
    }

    /// Parses the `source:key=value` form. A missing source is `unspec` and a
    /// missing value is empty.
    pub fn parse(s: &str) -> Self {
        let (source, rest) = match s.split_once(':') {
            Some((source, rest)) if !source.is_empty() => (source, rest),
            _ => (SOURCE_UNSPEC, s),
        };
        let (key, value) = rest.split_once('=').unwrap_or((rest, ""));
        Self::new(source, key, value)
    }

    /// The `source:key` form used as a key in identity objects.
    pub fn source_key(&self) -> String {
        format!("{}:{}", self.source, self.key)
    }
}

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.source, self.key)?;
        if !self.value.is_empty() {
            write!(f, "={}", self.value)?;
        }
        Ok(())
    }
}

// === impl Labels ===

impl Labels {
    pub fn insert(&mut self, label: Label) {
        self.0.insert(label.key.clone(), label);
    }

    pub fn get(&self, key: &str) -> Option<&Label> {
        self.0.get(key)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Label> {
        self.0.values()
    }

    /// Sorted printable forms, as stored in endpoint resources.
    pub fn to_printable(&self) -> Vec<String> {
        let mut printable = self.iter().map(ToString::to_string).collect::<Vec<_>>();
        printable.sort();
        printable
    }

    pub fn from_printable<S: AsRef<str>>(printable: &[S]) -> Self {
        printable.iter().map(|s| Label::parse(s.as_ref())).collect()
    }

    /// A deterministic string form of the set. Equal sets always produce the
    /// same string, regardless of insertion order.
    pub fn canonical(&self) -> String {
        self.to_printable().join(",")
    }

    /// The `source:key -> value` map stored on identity objects.
    pub fn to_security_labels(&self) -> BTreeMap<String, String> {
        self.iter()
            .map(|l| (l.source_key(), l.value.clone()))
            .collect()
    }

    pub fn from_security_labels(labels: &BTreeMap<String, String>) -> Self {
        labels
            .iter()
            .map(|(source_key, value)| {
                let mut label = Label::parse(source_key);
                label.value.clone_from(value);
                label
            })
            .collect()
    }
}

impl FromIterator<Label> for Labels {
    fn from_iter<T: IntoIterator<Item = Label>>(iter: T) -> Self {
        let mut labels = Self::default();
        for label in iter {
            labels.insert(label);
        }
        labels
    }
}

impl fmt::Display for Labels {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.canonical().fmt(f)
    }
}
