use serde_json::{Map, Value};

use crate::Error;

const REQUIRED_FIELDS: [&str; 4] = ["type", "from", "to", "data"];

/// The addressing part of a relay message.
///
/// This is all the relay needs to forward a message. The payload and the
/// message type are checked for presence only, their values are never
/// interpreted, so the raw text can be forwarded verbatim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub from: String,
    pub to: String,
}

impl Route {
    /// # Test
    ///
    /// ```
    /// use rtc_link_codec::{Error, Route};
    ///
    /// let route = Route::parse(r#"{"type":1,"from":"host","to":"client","data":"x"}"#).unwrap();
    /// assert_eq!(route.to, "client");
    ///
    /// let missing = Route::parse(r#"{"type":1,"from":"host","data":"x"}"#);
    /// assert!(matches!(missing, Err(Error::MissingField("to"))));
    /// ```
    pub fn parse(raw: &str) -> Result<Self, Error> {
        let object = serde_json::from_str::<Map<String, Value>>(raw)?;
        for field in REQUIRED_FIELDS {
            if !object.contains_key(field) {
                return Err(Error::MissingField(field));
            }
        }

        Ok(Self {
            from: Self::string_field(&object, "from")?,
            to: Self::string_field(&object, "to")?,
        })
    }

    pub fn is_self_addressed(&self) -> bool {
        self.from == self.to
    }

    fn string_field(object: &Map<String, Value>, name: &'static str) -> Result<String, Error> {
        match object.get(name) {
            Some(Value::String(value)) => Ok(value.clone()),
            Some(_) => Err(Error::InvalidField(name)),
            None => Err(Error::MissingField(name)),
        }
    }
}
