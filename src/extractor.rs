use std::hash::Hash;
use std::sync::Arc;

/// Marker bounds for an attribute extracted into an index.
///
/// Attributes are stored as keys of the inverted map, so they must be
/// hashable, comparable and cloneable, and they travel across threads with
/// the index.
pub trait IndexAttr: Eq + Hash + Clone + Send + Sync + 'static {}

impl<T: Eq + Hash + Clone + Send + Sync + 'static> IndexAttr for T {}

/// Result of extracting an attribute from an entry.
///
/// `None` is the extraction-failure sentinel: the entry is excluded from
/// the index but the cached value itself stays intact. `Collection` marks
/// a multi-valued attribute; whether its elements are indexed individually
/// is decided by the index's split-collection setting.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Extracted<A> {
    Value(A),
    Collection(Vec<A>),
    None,
}

impl<A> Extracted<A> {
    /// True when extraction failed.
    pub fn is_none(&self) -> bool {
        matches!(self, Extracted::None)
    }
}

/// Extracts an attribute from a cache entry for indexing and filtering.
///
/// Extractors are identified by [`name`](ValueExtractor::name): an index is
/// registered under its extractor's name and an index-aware filter finds
/// the index through the same name, so two extractors that compute the
/// same attribute must report the same name.
///
/// An extractor that reports [`targets_key`](ValueExtractor::targets_key)
/// operates on the immutable key; indexes over such extractors skip update
/// maintenance entirely.
pub trait ValueExtractor<K, V>: Send + Sync {
    /// The attribute type this extractor produces.
    type Attr: IndexAttr;

    /// Extracts the attribute from an entry. Returns [`Extracted::None`]
    /// when the entry has no usable attribute (extraction failure).
    fn extract(&self, key: &K, value: &V) -> Extracted<Self::Attr>;

    /// Stable identity of this extractor.
    fn name(&self) -> &str;

    /// True when the attribute is derived from the key alone.
    fn targets_key(&self) -> bool {
        false
    }
}

/// Writes an attribute back into a value; the inverse of extraction.
///
/// Used by entry processors that update a single attribute of a cached
/// value in place.
pub trait ValueUpdater<V, A>: Send + Sync {
    fn update(&self, target: &mut V, attribute: A);
}

/// Closure-backed extractor over the entry value.
///
/// # Examples
///
/// ```
/// use cachette::{AttributeExtractor, Extracted, ValueExtractor};
///
/// #[derive(Clone)]
/// struct Person { city: String }
///
/// let by_city = AttributeExtractor::new("city", |person: &Person| {
///     Extracted::Value(person.city.clone())
/// });
/// let alice = Person { city: "Aspen".into() };
/// assert_eq!(by_city.extract(&1, &alice), Extracted::Value("Aspen".to_string()));
/// ```
pub struct AttributeExtractor<V, A> {
    name: String,
    extract: Arc<dyn Fn(&V) -> Extracted<A> + Send + Sync>,
}

impl<V, A> AttributeExtractor<V, A> {
    pub fn new(
        name: impl Into<String>,
        extract: impl Fn(&V) -> Extracted<A> + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            extract: Arc::new(extract),
        }
    }
}

impl<V, A> Clone for AttributeExtractor<V, A> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            extract: Arc::clone(&self.extract),
        }
    }
}

impl<K, V, A: IndexAttr> ValueExtractor<K, V> for AttributeExtractor<V, A> {
    type Attr = A;

    fn extract(&self, _key: &K, value: &V) -> Extracted<A> {
        (self.extract)(value)
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Closure-backed extractor over the entry key.
///
/// Indexes built over a key extractor have immutable values: once a key is
/// indexed its attribute cannot change, so updates are no-ops.
pub struct KeyExtractor<K, A> {
    name: String,
    extract: Arc<dyn Fn(&K) -> Extracted<A> + Send + Sync>,
}

impl<K, A> KeyExtractor<K, A> {
    pub fn new(
        name: impl Into<String>,
        extract: impl Fn(&K) -> Extracted<A> + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            extract: Arc::new(extract),
        }
    }
}

impl<K, A> Clone for KeyExtractor<K, A> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            extract: Arc::clone(&self.extract),
        }
    }
}

impl<K, V, A: IndexAttr> ValueExtractor<K, V> for KeyExtractor<K, A> {
    type Attr = A;

    fn extract(&self, key: &K, _value: &V) -> Extracted<A> {
        (self.extract)(key)
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn targets_key(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_attribute_extractor() {
        let first_char =
            AttributeExtractor::new("first", |value: &String| match value.chars().next() {
                Some(c) => Extracted::Value(c),
                None => Extracted::None,
            });

        assert_eq!(
            ValueExtractor::<u32, String>::extract(&first_char, &1, &"abc".to_string()),
            Extracted::Value('a')
        );
        assert_eq!(
            ValueExtractor::<u32, String>::extract(&first_char, &1, &String::new()),
            Extracted::None
        );
        assert_eq!(ValueExtractor::<u32, String>::name(&first_char), "first");
        assert!(!ValueExtractor::<u32, String>::targets_key(&first_char));
    }

    #[test]
    fn test_key_extractor_targets_key() {
        let parity = KeyExtractor::new("parity", |key: &u32| Extracted::Value(key % 2));
        assert_eq!(
            ValueExtractor::<u32, String>::extract(&parity, &3, &"x".to_string()),
            Extracted::Value(1)
        );
        assert!(ValueExtractor::<u32, String>::targets_key(&parity));
    }

    #[test]
    fn test_collection_extraction() {
        let tags = AttributeExtractor::new("tags", |value: &Vec<String>| {
            Extracted::Collection(value.clone())
        });
        let value = vec!["a".to_string(), "b".to_string()];
        assert_eq!(
            ValueExtractor::<u32, Vec<String>>::extract(&tags, &1, &value),
            Extracted::Collection(value.clone())
        );
    }
}
