//! Transactional hash maps.

use std::fmt;
use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::Arc;

use super::{Stm, TRef, Tx};
use crate::value::Data;

const INITIAL_BUCKETS: usize = 16;

type Bucket<K, V> = TRef<Vec<(K, V)>>;
type Buckets<K, V> = Arc<[Bucket<K, V>]>;

fn index_of<K: Hash>(key: &K, buckets: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    (hasher.finish() as usize) % buckets
}

fn over_load_factor(size: usize, buckets: usize) -> bool {
    size * 4 > buckets * 3
}

fn new_buckets<K: Data, V: Data>(count: usize) -> Buckets<K, V> {
    (0..count).map(|_| TRef::new(Vec::new())).collect()
}

/// A hash map whose buckets are [`TRef`]s.
///
/// Lookups on keys in different buckets do not conflict with each other.
/// An insert that pushes the load factor past 0.75 doubles the table and
/// rehashes every bucket in the same transaction.
pub struct TMap<K, V> {
    buckets: TRef<Buckets<K, V>>,
    size: TRef<usize>,
}

impl<K, V> Clone for TMap<K, V> {
    fn clone(&self) -> Self {
        Self {
            buckets: self.buckets.clone(),
            size: self.size.clone(),
        }
    }
}

impl<K, V> fmt::Debug for TMap<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TMap").field("buckets", &self.buckets).finish()
    }
}

impl<K: Data + Hash + Eq, V: Data> Default for TMap<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Data + Hash + Eq, V: Data> TMap<K, V> {
    /// Create an empty map outside any transaction.
    pub fn new() -> Self {
        Self {
            buckets: TRef::new(new_buckets(INITIAL_BUCKETS)),
            size: TRef::new(0),
        }
    }

    /// Create an empty map inside a transaction.
    pub fn empty<E: Data>() -> Stm<Self, E> {
        Stm::sync(Self::new)
    }

    /// Create a map from key-value pairs; later pairs win.
    pub fn from_iter<E: Data>(pairs: impl IntoIterator<Item = (K, V)>) -> Stm<Self, E> {
        let pairs: Vec<(K, V)> = pairs.into_iter().collect();
        Self::empty().flat_map(move |map: TMap<K, V>| {
            let out = map.clone();
            Stm::for_each(pairs.clone(), move |(k, v)| map.put(k, v)).map_to(out)
        })
    }

    /// Number of buckets currently allocated.
    pub fn bucket_count<E: Data>(&self) -> Stm<usize, E> {
        self.buckets.get().map(|b: Buckets<K, V>| b.len())
    }

    fn bucket<E: Data>(&self, key: &K) -> Stm<Bucket<K, V>, E> {
        let key = key.clone();
        self.buckets
            .get()
            .map(move |b: Buckets<K, V>| b[index_of(&key, b.len())].clone())
    }

    /// Look up a key.
    pub fn get<E: Data>(&self, key: K) -> Stm<Option<V>, E> {
        self.bucket(&key).flat_map(move |bucket| {
            let key = key.clone();
            bucket.get().map(move |entries| {
                entries
                    .into_iter()
                    .find(|(k, _)| *k == key)
                    .map(|(_, v)| v)
            })
        })
    }

    /// Whether `key` is present.
    pub fn contains_key<E: Data>(&self, key: K) -> Stm<bool, E> {
        self.get(key).map(|v| v.is_some())
    }

    /// Insert or replace, growing the table if it gets too full.
    pub fn put<E: Data>(&self, key: K, value: V) -> Stm<(), E> {
        let map = self.clone();
        Stm::new(move |journal| {
            let buckets: Buckets<K, V> = tx_try!(map.buckets.get::<E>().run(journal));
            let bucket = &buckets[index_of(&key, buckets.len())];
            let mut entries = tx_try!(bucket.get::<E>().run(journal));
            if let Some(slot) = entries.iter_mut().find(|(k, _)| *k == key) {
                slot.1 = value.clone();
                return bucket.set(entries).run(journal);
            }
            entries.push((key.clone(), value.clone()));
            tx_try!(bucket.set::<E>(entries).run(journal));
            let size = tx_try!(map.size.update_and_get::<E>(|n| n + 1).run(journal));
            if over_load_factor(size, buckets.len()) {
                return map.resize(&buckets, buckets.len() * 2).run(journal);
            }
            Tx::Done(())
        })
    }

    fn resize<E: Data>(&self, old: &Buckets<K, V>, count: usize) -> Stm<(), E> {
        let old = old.clone();
        let buckets = self.buckets.clone();
        Stm::new(move |journal| {
            let mut rehashed: Vec<Vec<(K, V)>> = vec![Vec::new(); count];
            for bucket in old.iter() {
                for (k, v) in tx_try!(bucket.get::<E>().run(journal)) {
                    rehashed[index_of(&k, count)].push((k, v));
                }
            }
            let fresh: Buckets<K, V> = rehashed.into_iter().map(TRef::new).collect();
            buckets.set(fresh).run(journal)
        })
    }

    /// Remove a key, returning its value.
    pub fn remove<E: Data>(&self, key: K) -> Stm<Option<V>, E> {
        let map = self.clone();
        Stm::new(move |journal| {
            let bucket = tx_try!(map.bucket::<E>(&key).run(journal));
            let mut entries = tx_try!(bucket.get::<E>().run(journal));
            let Some(position) = entries.iter().position(|(k, _)| *k == key) else {
                return Tx::Done(None);
            };
            let (_, removed) = entries.swap_remove(position);
            tx_try!(bucket.set::<E>(entries).run(journal));
            tx_try!(map.size.update::<E>(|n| n - 1).run(journal));
            Tx::Done(Some(removed))
        })
    }

    /// Number of entries.
    pub fn size<E: Data>(&self) -> Stm<usize, E> {
        self.size.get()
    }

    /// Every entry, in unspecified order.
    pub fn to_vec<E: Data>(&self) -> Stm<Vec<(K, V)>, E> {
        self.buckets.get().flat_map(|buckets: Buckets<K, V>| {
            Stm::for_each(buckets.to_vec(), |bucket: Bucket<K, V>| bucket.get())
                .map(|all| all.into_iter().flatten().collect())
        })
    }

    /// Every key, in unspecified order.
    pub fn keys<E: Data>(&self) -> Stm<Vec<K>, E> {
        self.to_vec().map(|pairs| pairs.into_iter().map(|(k, _)| k).collect())
    }

    /// Every value, in unspecified order.
    pub fn values<E: Data>(&self) -> Stm<Vec<V>, E> {
        self.to_vec().map(|pairs| pairs.into_iter().map(|(_, v)| v).collect())
    }

    /// Fold over every entry, in unspecified order.
    pub fn fold<S: Data, E: Data>(
        &self,
        zero: S,
        f: impl Fn(S, (K, V)) -> S + Send + Sync + 'static,
    ) -> Stm<S, E> {
        self.to_vec()
            .map(move |pairs| pairs.into_iter().fold(zero.clone(), &f))
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::Runtime;
    use std::convert::Infallible;

    fn rt() -> Runtime {
        Runtime::builder().num_workers(1).build().unwrap()
    }

    #[test]
    fn test_put_get_remove() {
        let rt = rt();
        let map: TMap<String, i32> = TMap::new();
        let tx: Stm<(Option<i32>, Option<i32>, bool, usize)> = map
            .put("a".to_string(), 1)
            .zip_right(map.put("b".to_string(), 2))
            .zip_right(map.put("a".to_string(), 3))
            .zip_right(map.get("a".to_string()))
            .zip(map.remove("b".to_string()))
            .zip(map.contains_key("b".to_string()))
            .zip(map.size())
            .map(|(((a, b), c), d)| (a, b, c, d));
        assert_eq!(rt.run_sync(tx.commit()).unwrap(), (Some(3), Some(2), false, 1));
        assert_eq!(
            rt.run_sync(map.remove::<Infallible>("zzz".to_string()).commit()).unwrap(),
            None
        );
    }

    #[test]
    fn test_grows_past_load_factor() {
        let rt = rt();
        let map: TMap<u32, u32> = TMap::new();
        let fill: Stm<Vec<()>> = Stm::for_each(0..100u32, {
            let map = map.clone();
            move |n| map.put(n, n * n)
        });
        rt.run_sync(fill.commit()).unwrap();
        let buckets = rt.run_sync(map.bucket_count::<Infallible>().commit()).unwrap();
        assert!(buckets >= 128, "expected growth, got {} buckets", buckets);
        let mut keys = rt.run_sync(map.keys::<Infallible>().commit()).unwrap();
        keys.sort_unstable();
        assert_eq!(keys, (0..100).collect::<Vec<_>>());
        assert_eq!(
            rt.run_sync(map.get::<Infallible>(9).commit()).unwrap(),
            Some(81)
        );
    }

    #[test]
    fn test_from_iter_and_fold() {
        let rt = rt();
        let tx: Stm<(usize, i32, Vec<i32>)> = TMap::from_iter(vec![(1, 10), (2, 20), (1, 11)])
            .flat_map(|map: TMap<i32, i32>| {
                map.size()
                    .zip(map.fold(0, |acc, (_, v)| acc + v))
                    .zip(map.values())
                    .map(|((s, sum), mut vs)| {
                        vs.sort_unstable();
                        (s, sum, vs)
                    })
            });
        assert_eq!(rt.run_sync(tx.commit()).unwrap(), (2, 31, vec![11, 20]));
    }
}
