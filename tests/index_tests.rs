use std::collections::HashSet;

use cachette::{
    AttributeExtractor, EqualsFilter, Extracted, InFilter, LocalCache, PredicateFilter,
};

#[derive(Clone, Debug, PartialEq)]
struct Person {
    city: String,
    nicknames: Vec<String>,
}

fn person(city: &str, nicknames: &[&str]) -> Person {
    Person {
        city: city.to_string(),
        nicknames: nicknames.iter().map(|n| n.to_string()).collect(),
    }
}

fn city_extractor() -> AttributeExtractor<Person, String> {
    AttributeExtractor::new("city", |p: &Person| {
        if p.city.is_empty() {
            Extracted::None
        } else {
            Extracted::Value(p.city.clone())
        }
    })
}

fn nickname_extractor() -> AttributeExtractor<Person, String> {
    AttributeExtractor::new("nicknames", |p: &Person| {
        Extracted::Collection(p.nicknames.clone())
    })
}

/// The canonical index lifecycle: insert maps the attribute, update moves
/// the key between buckets, delete empties the index.
#[test]
fn test_index_insert_update_delete() {
    let cache: LocalCache<u32, Person> = LocalCache::builder("idx-lifecycle").build().unwrap();
    cache.add_index(city_extractor(), false).unwrap();

    cache.insert(1, person("A", &[])).unwrap();
    let by_a = EqualsFilter::new(city_extractor(), "A".to_string());
    assert_eq!(cache.get_keys(&by_a), vec![1]);

    cache.insert(1, person("B", &[])).unwrap();
    let by_b = EqualsFilter::new(city_extractor(), "B".to_string());
    assert!(cache.get_keys(&by_a).is_empty());
    assert_eq!(cache.get_keys(&by_b), vec![1]);

    cache.remove(&1).unwrap();
    assert!(cache.get_keys(&by_a).is_empty());
    assert!(cache.get_keys(&by_b).is_empty());
}

/// An index added to a populated cache covers the existing entries.
#[test]
fn test_index_added_after_population() {
    let cache: LocalCache<u32, Person> = LocalCache::builder("idx-late").build().unwrap();
    cache.insert(1, person("A", &[])).unwrap();
    cache.insert(2, person("B", &[])).unwrap();
    cache.insert(3, person("A", &[])).unwrap();

    cache.add_index(city_extractor(), false).unwrap();

    let filter = EqualsFilter::new(city_extractor(), "A".to_string());
    let keys: HashSet<u32> = cache.get_keys(&filter).into_iter().collect();
    assert_eq!(keys, HashSet::from([1, 3]));
}

/// Collection attributes map each element to the key individually, and an
/// update removes only the dropped elements.
#[test]
fn test_collection_attribute_indexing() {
    let cache: LocalCache<u32, Person> = LocalCache::builder("idx-collection").build().unwrap();
    cache.add_index(nickname_extractor(), false).unwrap();

    cache.insert(1, person("A", &["ace", "champ"])).unwrap();
    cache.insert(2, person("B", &["champ"])).unwrap();

    let by_champ = EqualsFilter::new(nickname_extractor(), "champ".to_string());
    let keys: HashSet<u32> = cache.get_keys(&by_champ).into_iter().collect();
    assert_eq!(keys, HashSet::from([1, 2]));

    // Dropping one nickname only removes that one mapping.
    cache.insert(1, person("A", &["ace"])).unwrap();
    assert_eq!(cache.get_keys(&by_champ), vec![2]);
    let by_ace = EqualsFilter::new(nickname_extractor(), "ace".to_string());
    assert_eq!(cache.get_keys(&by_ace), vec![1]);
}

/// Extraction failure excludes the entry from the index without touching
/// the cached value; recovery on a later update re-indexes it.
#[test]
fn test_extraction_failure_keeps_value_intact() {
    let cache: LocalCache<u32, Person> = LocalCache::builder("idx-excluded").build().unwrap();
    cache.add_index(city_extractor(), false).unwrap();

    cache.insert(1, person("", &[])).unwrap();
    assert_eq!(cache.get(&1), Some(person("", &[])));
    let any_city = PredicateFilter::new(|_: &u32, p: &Person| !p.city.is_empty());
    assert!(cache.get_keys(&any_city).is_empty());

    cache.insert(1, person("C", &[])).unwrap();
    let by_c = EqualsFilter::new(city_extractor(), "C".to_string());
    assert_eq!(cache.get_keys(&by_c), vec![1]);
}

/// Index-aware filters answer from the inverted map; removing the index
/// falls back to a full scan with identical results.
#[test]
fn test_queries_with_and_without_index() {
    let cache: LocalCache<u32, Person> = LocalCache::builder("idx-queries").build().unwrap();
    for key in 0..20 {
        let city = if key % 2 == 0 { "even" } else { "odd" };
        cache.insert(key, person(city, &[])).unwrap();
    }

    let filter = InFilter::new(city_extractor(), vec!["even".to_string()]);

    let scanned: HashSet<u32> = cache.get_keys(&filter).into_iter().collect();
    cache.add_index(city_extractor(), false).unwrap();
    let indexed: HashSet<u32> = cache.get_keys(&filter).into_iter().collect();

    assert_eq!(scanned, indexed);
    assert_eq!(indexed.len(), 10);

    let values = cache.get_values(&filter);
    assert_eq!(values.len(), 10);
    assert!(values.iter().all(|p| p.city == "even"));

    let entries = cache.get_entries_sorted(&filter, |a, b| a.city.cmp(&b.city));
    assert_eq!(entries.len(), 10);
}

/// Index maintenance is linearized with mutations: a filter evaluated
/// after an insert always sees it.
#[test]
fn test_index_consistency_under_concurrency() {
    use std::sync::Arc;
    use std::thread;

    let cache: Arc<LocalCache<u32, Person>> =
        Arc::new(LocalCache::builder("idx-concurrent").build().unwrap());
    cache.add_index(city_extractor(), false).unwrap();

    let writers: Vec<_> = (0..4)
        .map(|w| {
            let cache = Arc::clone(&cache);
            thread::spawn(move || {
                for i in 0..50 {
                    let key = w * 100 + i;
                    cache.insert(key, person("X", &[])).unwrap();
                    let filter = EqualsFilter::new(city_extractor(), "X".to_string());
                    assert!(cache.get_keys(&filter).contains(&key));
                }
            })
        })
        .collect();
    for writer in writers {
        writer.join().unwrap();
    }

    let filter = EqualsFilter::new(city_extractor(), "X".to_string());
    assert_eq!(cache.get_keys(&filter).len(), 200);
}
