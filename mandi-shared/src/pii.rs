use serde::{Deserialize, Serialize, Serializer};
use std::fmt;

/// Wraps payer details (card suffix, UPI handle, bank account) so they never
/// show up in `Debug`/`Display` output, while still serializing the real value
/// for API responses and persistence.
#[derive(Clone, PartialEq, Eq, Deserialize)]
pub struct Masked<T>(pub T);

impl<T> fmt::Debug for Masked<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "********")
    }
}

impl<T> fmt::Display for Masked<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "********")
    }
}

impl<T: Serialize> Serialize for Masked<T> {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        self.0.serialize(serializer)
    }
}

impl<T> Masked<T> {
    pub fn new(value: T) -> Self {
        Self(value)
    }

    pub fn expose(&self) -> &T {
        &self.0
    }

    pub fn into_inner(self) -> T {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_masked_hides_value_in_logs() {
        let vpa = Masked::new("buyer@okbank".to_string());
        assert_eq!(format!("{:?}", vpa), "********");
        assert_eq!(format!("{}", vpa), "********");
    }

    #[test]
    fn test_masked_serializes_real_value() {
        let vpa = Masked::new("buyer@okbank".to_string());
        let json = serde_json::to_string(&vpa).unwrap();
        assert_eq!(json, "\"buyer@okbank\"");
    }
}
