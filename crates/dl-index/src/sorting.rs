use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

type LessFn<T> = Arc<dyn Fn(&T, &T) -> bool + Send + Sync>;

/// A named sort order for the projection.
///
/// `less` is always the ascending strict weak order; `ascending` picks the
/// direction. Equal elements fall back to their backing index, which makes
/// the order total and a descending order exactly the reverse of the
/// ascending one.
pub struct Sorting<T> {
    key: String,
    ascending: bool,
    less: LessFn<T>,
}

impl<T> Sorting<T> {
    pub fn new<F>(key: impl Into<String>, ascending: bool, less: F) -> Self
    where
        F: Fn(&T, &T) -> bool + Send + Sync + 'static,
    {
        Self {
            key: key.into(),
            ascending,
            less: Arc::new(less),
        }
    }

    /// Sort by a key extracted from each element.
    pub fn by_key<K, F>(key: impl Into<String>, ascending: bool, f: F) -> Self
    where
        K: Ord,
        F: Fn(&T) -> K + Send + Sync + 'static,
    {
        Self::new(key, ascending, move |a, b| f(a) < f(b))
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn is_ascending(&self) -> bool {
        self.ascending
    }

    /// Same key, opposite direction.
    pub fn reversed(&self) -> Self {
        Self {
            key: self.key.clone(),
            ascending: !self.ascending,
            less: self.less.clone(),
        }
    }

    /// Is `self` the same order as `other` flipped?
    pub fn is_reverse_of(&self, other: &Sorting<T>) -> bool {
        self.key == other.key && self.ascending != other.ascending
    }

    /// Strict total order on backing indices `a` and `b`.
    pub(crate) fn precedes(&self, backing: &[T], a: usize, b: usize) -> bool {
        let (x, y) = if self.ascending { (a, b) } else { (b, a) };
        let (vx, vy) = (&backing[x], &backing[y]);
        (self.less)(vx, vy) || (!(self.less)(vy, vx) && x < y)
    }
}

impl<T> Clone for Sorting<T> {
    fn clone(&self) -> Self {
        Self {
            key: self.key.clone(),
            ascending: self.ascending,
            less: self.less.clone(),
        }
    }
}

impl<T> fmt::Debug for Sorting<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Sorting")
            .field("key", &self.key)
            .field("ascending", &self.ascending)
            .finish()
    }
}

/// Order of two backing indices under an optional sorting. Without one the
/// projection follows backing order.
pub(crate) fn precedes<T>(sorting: Option<&Sorting<T>>, backing: &[T], a: usize, b: usize) -> bool {
    match sorting {
        Some(s) => s.precedes(backing, a, b),
        None => a < b,
    }
}

pub(crate) fn compare<T>(sorting: Option<&Sorting<T>>, backing: &[T], a: usize, b: usize) -> Ordering {
    if a == b {
        Ordering::Equal
    } else if precedes(sorting, backing, a, b) {
        Ordering::Less
    } else {
        Ordering::Greater
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ties_break_on_index() {
        let backing = [5, 3, 5];
        let asc = Sorting::by_key("n", true, |v: &i32| *v);
        assert!(asc.precedes(&backing, 1, 0));
        assert!(asc.precedes(&backing, 0, 2));
        assert!(!asc.precedes(&backing, 2, 0));

        let desc = asc.reversed();
        assert!(desc.precedes(&backing, 2, 0));
        assert!(desc.precedes(&backing, 0, 1));
        assert!(desc.is_reverse_of(&asc));
        assert!(!asc.is_reverse_of(&asc.clone()));
    }

    #[test]
    fn test_without_sorting_uses_index_order() {
        let backing = [9, 1];
        assert!(precedes::<i32>(None, &backing, 0, 1));
        assert_eq!(compare::<i32>(None, &backing, 1, 1), Ordering::Equal);
    }
}
