//! Items carried by streams.

use std::fmt;
use std::sync::Arc;

/// A value a stream can carry to its subscribers.
///
/// Anything serializable is streamable; writers decide the wire encoding.
pub trait Streamable: fmt::Debug + Send + Sync + 'static {
    /// Convert the item into a JSON value.
    ///
    /// # Errors
    ///
    /// Returns an error if the item cannot be represented as JSON.
    fn to_json(&self) -> Result<serde_json::Value, serde_json::Error>;
}

impl<T> Streamable for T
where
    T: serde::Serialize + fmt::Debug + Send + Sync + 'static,
{
    fn to_json(&self) -> Result<serde_json::Value, serde_json::Error> {
        serde_json::to_value(self)
    }
}

/// A shared stream item. Fan-out clones the pointer, not the value.
pub type Item = Arc<dyn Streamable>;

/// Wrap a value as a stream item.
pub fn item<T: Streamable>(value: T) -> Item {
    Arc::new(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Serialize;
    use serde_json::json;

    #[derive(Debug, Serialize)]
    struct Trade {
        symbol: &'static str,
        price: u32,
    }

    #[test]
    fn test_struct_to_json() {
        let trade = item(Trade {
            symbol: "ACME",
            price: 42,
        });
        assert_eq!(
            trade.to_json().unwrap(),
            json!({"symbol": "ACME", "price": 42})
        );
    }

    #[test]
    fn test_json_value_is_streamable() {
        let value = item(json!([1, 2, 3]));
        assert_eq!(value.to_json().unwrap(), json!([1, 2, 3]));
    }
}
