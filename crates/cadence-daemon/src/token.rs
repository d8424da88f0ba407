use std::fmt;

/// Tags one asynchronous request.  A result is applied only while its token
/// is still the one the event loop is waiting for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestToken(u64);

impl fmt::Display for RequestToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Monotonic token issuer, owned by the event loop.
#[derive(Debug, Default)]
pub struct TokenSource {
    last: u64,
}

impl TokenSource {
    pub fn issue(&mut self) -> RequestToken {
        self.last += 1;
        RequestToken(self.last)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tokens_increase() {
        let mut source = TokenSource::default();
        let a = source.issue();
        let b = source.issue();
        assert!(b > a);
        assert_ne!(a, b);
    }
}
