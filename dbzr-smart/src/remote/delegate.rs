/// The real object behind a remote proxy, bound the first time an operation
/// has no verb the server understands.
#[derive(Debug, Default)]
pub enum Delegate<T> {
    #[default]
    Unbound,
    Bound(T),
}

impl<T> Delegate<T> {
    pub fn is_bound(&self) -> bool {
        matches!(self, Delegate::Bound(_))
    }

    pub fn get(&self) -> Option<&T> {
        match self {
            Delegate::Bound(real) => Some(real),
            Delegate::Unbound => None,
        }
    }

    pub fn get_mut(&mut self) -> Option<&mut T> {
        match self {
            Delegate::Bound(real) => Some(real),
            Delegate::Unbound => None,
        }
    }

    pub fn take(&mut self) -> Option<T> {
        match std::mem::take(self) {
            Delegate::Bound(real) => Some(real),
            Delegate::Unbound => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bind_and_take() {
        let mut delegate: Delegate<u32> = Delegate::Unbound;
        assert!(!delegate.is_bound());
        assert!(delegate.get().is_none());
        delegate = Delegate::Bound(7);
        if let Some(real) = delegate.get_mut() {
            *real += 1;
        }
        assert_eq!(delegate.get(), Some(&8));
        assert_eq!(delegate.take(), Some(8));
        assert!(!delegate.is_bound());
    }
}
