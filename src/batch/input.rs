//! Input collection shapes accepted by the aggregator.

/// The shapes an item collection can arrive in.
///
/// List endpoints hand back a flat page, infinite scrolling accumulates a
/// list of pages, and detail views hold a single record.
#[derive(Debug, Clone, PartialEq)]
pub enum ItemSource<T> {
    /// Nothing loaded yet.
    Absent,
    /// A single record.
    Single(T),
    /// A flat, ordered list.
    List(Vec<T>),
    /// Pages in load order, each an ordered list.
    Pages(Vec<Vec<T>>),
}

impl<T> Default for ItemSource<T> {
    fn default() -> Self {
        ItemSource::Absent
    }
}

impl<T> ItemSource<T> {
    /// Flatten into a single ordered sequence.
    ///
    /// Pages are concatenated in page order and items keep their order
    /// within each page.
    pub fn normalize(self) -> Vec<T> {
        match self {
            ItemSource::Absent => Vec::new(),
            ItemSource::Single(item) => vec![item],
            ItemSource::List(items) => items,
            ItemSource::Pages(pages) => pages.into_iter().flatten().collect(),
        }
    }
}

impl<T> From<Option<T>> for ItemSource<T> {
    fn from(item: Option<T>) -> Self {
        match item {
            Some(item) => ItemSource::Single(item),
            None => ItemSource::Absent,
        }
    }
}

impl<T> From<Vec<T>> for ItemSource<T> {
    fn from(items: Vec<T>) -> Self {
        ItemSource::List(items)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pages_flatten_in_order() {
        let pages = ItemSource::Pages(vec![vec!["a", "b"], vec!["c"]]);
        let flat = ItemSource::List(vec!["a", "b", "c"]);
        assert_eq!(pages.normalize(), vec!["a", "b", "c"]);
        assert_eq!(flat.normalize(), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_absent_and_single() {
        assert!(ItemSource::<u32>::Absent.normalize().is_empty());
        assert_eq!(ItemSource::Single(7).normalize(), vec![7]);
        assert_eq!(ItemSource::from(None::<u32>), ItemSource::Absent);
        assert_eq!(ItemSource::from(Some(1)).normalize(), vec![1]);
    }

    #[test]
    fn test_normalize_is_idempotent() {
        let once = ItemSource::Pages(vec![vec![3, 1], vec![], vec![2]]).normalize();
        let twice = ItemSource::List(once.clone()).normalize();
        assert_eq!(once, vec![3, 1, 2]);
        assert_eq!(once, twice);
    }
}
