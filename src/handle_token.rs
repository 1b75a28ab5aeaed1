use std::fmt::{self, Debug, Display};

use rand::{distributions::Alphanumeric, thread_rng, Rng};
use serde::{Deserialize, Serialize};
use zbus::{
    names::OwnedMemberName,
    zvariant::{ObjectPath, OwnedObjectPath, Type},
};

/// A handle token is a D-Bus object path element, the last segment of a
/// request or session object path
/// `/org/freedesktop/portal/desktop/request/SENDER/TOKEN`.
///
/// A valid token must only contain the ASCII characters `[A-Z][a-z][0-9]_`.
#[derive(Serialize, Deserialize, Type, Clone, PartialEq, Eq, Hash)]
pub struct HandleToken(OwnedMemberName);

impl Display for HandleToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Debug for HandleToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("HandleToken")
            .field(&self.0.as_str())
            .finish()
    }
}

impl Default for HandleToken {
    fn default() -> Self {
        let mut rng = thread_rng();
        let token: String = (&mut rng)
            .sample_iter(Alphanumeric)
            .take(10)
            .map(char::from)
            .collect();
        HandleToken::try_from(format!("waypost_{token}")).unwrap()
    }
}

/// The error returned when a string contains a character that is not valid
/// in an object path element.
#[derive(Debug)]
pub struct HandleInvalidCharacter(char);

impl fmt::Display for HandleInvalidCharacter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_fmt(format_args!("Invalid Character {}", self.0))
    }
}

impl std::error::Error for HandleInvalidCharacter {}

impl TryFrom<&str> for HandleToken {
    type Error = HandleInvalidCharacter;
    fn try_from(value: &str) -> Result<Self, Self::Error> {
        for char in value.chars() {
            if !char.is_ascii_alphanumeric() && char != '_' {
                return Err(HandleInvalidCharacter(char));
            }
        }
        Ok(Self(
            OwnedMemberName::try_from(value).expect("Invalid handle token"),
        ))
    }
}

impl TryFrom<String> for HandleToken {
    type Error = HandleInvalidCharacter;
    fn try_from(value: String) -> Result<Self, Self::Error> {
        HandleToken::try_from(value.as_str())
    }
}

impl TryFrom<&ObjectPath<'_>> for HandleToken {
    type Error = HandleInvalidCharacter;
    fn try_from(value: &ObjectPath<'_>) -> Result<Self, Self::Error> {
        let last_segment = value.as_str().split('/').next_back().unwrap_or_default();
        HandleToken::try_from(last_segment)
    }
}

impl TryFrom<&OwnedObjectPath> for HandleToken {
    type Error = HandleInvalidCharacter;
    fn try_from(value: &OwnedObjectPath) -> Result<Self, Self::Error> {
        HandleToken::try_from(&**value)
    }
}

#[cfg(test)]
mod test {
    use super::HandleToken;
    use zbus::zvariant::ObjectPath;

    #[test]
    fn handle_token() {
        assert!(HandleToken::try_from("token").is_ok());

        let token = HandleToken::try_from("token2").unwrap();
        assert_eq!(token.to_string(), "token2".to_string());

        assert!(HandleToken::try_from("/test").is_err());

        assert!(HandleToken::try_from("تجربة").is_err());

        assert!(HandleToken::try_from("test_token").is_ok());

        HandleToken::default(); // ensure we don't panic
    }

    #[test]
    fn from_object_path() {
        let path = ObjectPath::try_from(
            "/org/freedesktop/portal/desktop/session/1_42/waypost_session1",
        )
        .unwrap();
        let token = HandleToken::try_from(&path).unwrap();
        assert_eq!(token.to_string(), "waypost_session1");
    }
}
