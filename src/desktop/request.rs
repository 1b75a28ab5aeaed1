use std::collections::HashMap;
use std::fmt::{self, Debug};

use serde::{ser::SerializeTuple, Serialize, Serializer};
use serde_repr::{Deserialize_repr, Serialize_repr};
use zbus::zvariant::{Signature, Type, Value};

/// The reply sent for a portal method backed by a request: a response code
/// and a vardict of results.
///
/// The numeric codes are shared by every request-style completion across
/// the backend and must stay bit-exact: `0` success, `1` the user
/// explicitly declined, `2` the interaction ended some other way
/// (dismissed dialog, client cancellation, collaborator failure).
pub enum Response<T> {
    /// Success, the request is carried out.
    Ok(T),
    /// The user cancelled the request or something else happened.
    Err(ResponseError),
}

impl<T> Response<T> {
    /// A successful response carrying `results`.
    pub fn ok(results: T) -> Self {
        Self::Ok(results)
    }

    /// The user explicitly declined (response code 1).
    pub fn cancelled() -> Self {
        Self::Err(ResponseError::Cancelled)
    }

    /// The interaction ended some other way (response code 2).
    pub fn other() -> Self {
        Self::Err(ResponseError::Other)
    }

    /// The numeric response code of this reply.
    pub fn response_type(&self) -> ResponseType {
        match self {
            Self::Ok(_) => ResponseType::Success,
            Self::Err(err) => (*err).into(),
        }
    }
}

impl<T> Type for Response<T> {
    const SIGNATURE: &'static Signature =
        <(ResponseType, HashMap<&'static str, Value<'static>>)>::SIGNATURE;
}

#[derive(Serialize, Type, Debug, Default)]
#[zvariant(signature = "dict")]
struct NoResults {}

impl<T> Serialize for Response<T>
where
    T: Serialize + Type,
{
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut tuple = serializer.serialize_tuple(2)?;
        match self {
            Self::Ok(results) => {
                tuple.serialize_element(&ResponseType::Success)?;
                tuple.serialize_element(results)?;
            }
            Self::Err(err) => {
                tuple.serialize_element(&ResponseType::from(*err))?;
                // An unsuccessful reply carries no results.
                tuple.serialize_element(&NoResults::default())?;
            }
        }
        tuple.end()
    }
}

impl<T> Debug for Response<T>
where
    T: Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ok(results) => f.debug_tuple("Response::Ok").field(results).finish(),
            Self::Err(err) => f.debug_tuple("Response::Err").field(err).finish(),
        }
    }
}

/// An unsuccessful outcome of a portal request.
#[derive(Debug, Copy, PartialEq, Eq, Hash, Clone)]
pub enum ResponseError {
    /// The user cancelled the request.
    Cancelled,
    /// Something else happened.
    Other,
}

impl std::error::Error for ResponseError {}

impl fmt::Display for ResponseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cancelled => f.write_str("Cancelled"),
            Self::Other => f.write_str("Other"),
        }
    }
}

/// The status a portal request reply starts with.
#[derive(Serialize_repr, Deserialize_repr, PartialEq, Eq, Copy, Clone, Debug, Type)]
#[repr(u32)]
pub enum ResponseType {
    /// Success, the request is carried out.
    Success = 0,
    /// The user cancelled the interaction.
    Cancelled = 1,
    /// The user interaction was ended in some other way.
    Other = 2,
}

impl From<ResponseError> for ResponseType {
    fn from(err: ResponseError) -> Self {
        match err {
            ResponseError::Other => Self::Other,
            ResponseError::Cancelled => Self::Cancelled,
        }
    }
}

#[cfg(test)]
mod tests {
    use serde::Serialize;
    use zbus::zvariant::Type;

    use super::*;

    #[derive(Serialize, Type, Debug, Default)]
    #[zvariant(signature = "dict")]
    struct SomeResults {
        #[serde(with = "zbus::zvariant::as_value")]
        success: bool,
    }

    #[test]
    fn response_codes() {
        assert_eq!(
            Response::ok(SomeResults { success: true }).response_type(),
            ResponseType::Success
        );
        assert_eq!(
            Response::<SomeResults>::cancelled().response_type(),
            ResponseType::Cancelled
        );
        assert_eq!(
            Response::<SomeResults>::other().response_type(),
            ResponseType::Other
        );
    }

    #[test]
    fn response_serialization() {
        let ok = serde_json::to_value(Response::ok(SomeResults { success: true })).unwrap();
        assert_eq!(ok[0], 0);

        let cancelled = serde_json::to_value(Response::<SomeResults>::cancelled()).unwrap();
        assert_eq!(cancelled[0], 1);

        let other = serde_json::to_value(Response::<SomeResults>::other()).unwrap();
        assert_eq!(other[0], 2);
    }

    #[test]
    fn response_signature() {
        assert_eq!(
            Response::<SomeResults>::SIGNATURE.to_string(),
            "(ua{sv})".to_string()
        );
    }
}
