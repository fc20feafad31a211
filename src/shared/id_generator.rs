use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use uuid::Uuid;

/// IdGenerator trait for abstracting identifier generation
/// Used for STOMP subscription ids
pub trait IdGenerator: Send + Sync {
    /// Generate a new identifier
    fn next_id(&self) -> String;
}

/// Production implementation producing `sub-<uuid v4>` identifiers
#[derive(Debug, Clone, Default)]
pub struct RandomIdGenerator;

impl RandomIdGenerator {
    pub fn new() -> Self {
        Self
    }
}

impl IdGenerator for RandomIdGenerator {
    fn next_id(&self) -> String {
        format!("sub-{}", Uuid::new_v4())
    }
}

/// Test implementation returning a fixed sequence of identifiers
/// Wraps around to the beginning once the list is exhausted
#[derive(Debug, Clone)]
pub struct FixedIdGenerator {
    ids: Vec<String>,
    index: Arc<AtomicUsize>,
}

impl FixedIdGenerator {
    pub fn new(ids: Vec<String>) -> Self {
        Self {
            ids,
            index: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Always return the same identifier
    pub fn single(id: impl Into<String>) -> Self {
        Self::new(vec![id.into()])
    }

    pub fn from_strings(ids: &[&str]) -> Self {
        Self::new(ids.iter().map(|s| s.to_string()).collect())
    }

    /// Number of identifiers handed out so far
    pub fn issued(&self) -> usize {
        self.index.load(Ordering::SeqCst)
    }
}

impl IdGenerator for FixedIdGenerator {
    fn next_id(&self) -> String {
        if self.ids.is_empty() {
            return String::new();
        }
        let index = self.index.fetch_add(1, Ordering::SeqCst);
        self.ids[index % self.ids.len()].clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_random_id_generator() {
        let generator = RandomIdGenerator::new();

        let id1 = generator.next_id();
        let id2 = generator.next_id();

        assert!(id1.starts_with("sub-"));
        assert!(Uuid::parse_str(&id1["sub-".len()..]).is_ok());
        assert_ne!(id1, id2);
    }

    #[test]
    fn test_fixed_id_generator_sequence_wraps() {
        let generator = FixedIdGenerator::from_strings(&["sub-0", "sub-1"]);

        assert_eq!(generator.next_id(), "sub-0");
        assert_eq!(generator.next_id(), "sub-1");
        assert_eq!(generator.next_id(), "sub-0");
        assert_eq!(generator.issued(), 3);
    }

    #[test]
    fn test_fixed_id_generator_single_and_empty() {
        let generator = FixedIdGenerator::single("sub-fixed");
        assert_eq!(generator.next_id(), "sub-fixed");
        assert_eq!(generator.next_id(), "sub-fixed");

        let empty = FixedIdGenerator::new(Vec::new());
        assert_eq!(empty.next_id(), "");
    }

    #[test]
    fn test_fixed_id_generator_clones_share_counter() {
        let generator = FixedIdGenerator::from_strings(&["a", "b", "c"]);
        let clone = generator.clone();

        assert_eq!(generator.next_id(), "a");
        assert_eq!(clone.next_id(), "b");
        assert_eq!(generator.issued(), 2);
    }
}
