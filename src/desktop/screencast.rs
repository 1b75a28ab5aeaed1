//! Wire types of the `org.freedesktop.impl.portal.ScreenCast` interface.

use std::fmt::Debug;

use enumflags2::{bitflags, BitFlags};
use serde::{Deserialize, Serialize};
use serde_repr::{Deserialize_repr, Serialize_repr};
use zbus::zvariant::{
    as_value::{self, optional},
    Type,
};

/// A bit flag for the available sources to record.
#[bitflags]
#[derive(Serialize_repr, Deserialize_repr, PartialEq, Eq, Copy, Clone, Debug, Type)]
#[repr(u32)]
pub enum SourceType {
    /// A monitor.
    Monitor,
    /// A specific window.
    Window,
    /// Virtual.
    Virtual,
}

/// A bit flag for the possible cursor modes.
#[bitflags]
#[derive(Serialize_repr, Deserialize_repr, PartialEq, Eq, Debug, Copy, Clone, Type)]
#[repr(u32)]
pub enum CursorMode {
    /// The cursor is not part of the screen cast stream.
    Hidden,
    /// The cursor is embedded as part of the stream buffers.
    Embedded,
    /// The cursor is not part of the screen cast stream, but sent as PipeWire
    /// stream metadata.
    Metadata,
}

/// Options received with a `CreateSession` call.
#[derive(Serialize, Deserialize, Type, Debug, Default)]
#[zvariant(signature = "dict")]
pub struct CreateSessionOptions {}

/// Options received with a `SelectSources` call.
///
/// The calls only record the intended configuration; no compositor I/O
/// happens until `Start`. Unknown dict entries are tolerated and ignored.
#[derive(Serialize, Deserialize, Type, Debug, Default)]
#[zvariant(signature = "dict")]
pub struct SelectSourcesOptions {
    #[serde(default, with = "optional", skip_serializing_if = "Option::is_none")]
    types: Option<BitFlags<SourceType>>,
    #[serde(default, with = "optional", skip_serializing_if = "Option::is_none")]
    multiple: Option<bool>,
    #[serde(default, with = "optional", skip_serializing_if = "Option::is_none")]
    cursor_mode: Option<CursorMode>,
}

impl SelectSourcesOptions {
    /// What types of content to record.
    pub fn types(&self) -> Option<BitFlags<SourceType>> {
        self.types
    }

    /// Whether to allow selecting multiple sources.
    pub fn is_multiple(&self) -> Option<bool> {
        self.multiple
    }

    /// How the cursor should be drawn in the streams.
    pub fn cursor_mode(&self) -> Option<CursorMode> {
        self.cursor_mode
    }

    /// Sets the types of content to record.
    #[must_use]
    pub fn set_types(mut self, types: impl Into<Option<BitFlags<SourceType>>>) -> Self {
        self.types = types.into();
        self
    }

    /// Sets whether to allow selecting multiple sources.
    #[must_use]
    pub fn set_multiple(mut self, multiple: impl Into<Option<bool>>) -> Self {
        self.multiple = multiple.into();
        self
    }

    /// Sets how the cursor should be drawn.
    #[must_use]
    pub fn set_cursor_mode(mut self, cursor_mode: impl Into<Option<CursorMode>>) -> Self {
        self.cursor_mode = cursor_mode.into();
        self
    }
}

/// Options received with an `OpenPipeWireRemote` call.
#[derive(Serialize, Deserialize, Type, Debug, Default)]
#[zvariant(signature = "dict")]
pub struct OpenPipeWireRemoteOptions {}

/// A `SelectSources` reply carries no results.
#[derive(Serialize, Deserialize, Type, Debug, Default)]
#[zvariant(signature = "dict")]
pub struct SelectSourcesResponse {}

/// Options received with a `Start` call.
#[derive(Serialize, Deserialize, Type, Debug, Default)]
#[zvariant(signature = "dict")]
pub struct StartCastOptions {}

/// The results of a successful screen cast `Start`: the negotiated streams.
#[derive(Default, Serialize, Deserialize, Type)]
#[zvariant(signature = "dict")]
pub struct Streams {
    #[serde(default, with = "as_value", skip_serializing_if = "Vec::is_empty")]
    streams: Vec<Stream>,
}

impl Streams {
    /// The list of streams.
    pub fn streams(&self) -> &[Stream] {
        &self.streams
    }
}

impl Debug for Streams {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Streams").field(&self.streams).finish()
    }
}

/// A [builder-pattern] type to construct [`Streams`].
///
/// [builder-pattern]: https://doc.rust-lang.org/1.0.0/style/ownership/builders.html
pub struct StreamsBuilder {
    streams: Streams,
}

impl StreamsBuilder {
    /// Create a new instance of a streams builder.
    pub fn new(streams: Vec<Stream>) -> Self {
        Self {
            streams: Streams { streams },
        }
    }

    /// Build the [`Streams`].
    pub fn build(self) -> Streams {
        self.streams
    }
}

/// A PipeWire stream.
#[derive(Clone, Serialize, Deserialize, Type)]
pub struct Stream(u32, StreamProperties);

impl Stream {
    /// The PipeWire stream Node ID.
    pub fn pipe_wire_node_id(&self) -> u32 {
        self.0
    }

    /// A tuple consisting of the position (x, y) in the compositor
    /// coordinate space.
    ///
    /// **Note** the position may not be equivalent to a position in a pixel
    /// coordinate space. Only available for monitor streams.
    pub fn position(&self) -> Option<(i32, i32)> {
        self.1.position
    }

    /// A tuple consisting of (width, height) in the compositor coordinate
    /// space.
    pub fn size(&self) -> Option<(i32, i32)> {
        self.1.size
    }

    /// The source type of the stream.
    pub fn source_type(&self) -> Option<SourceType> {
        self.1.source_type
    }
}

impl Debug for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stream")
            .field("pipewire_node_id", &self.pipe_wire_node_id())
            .field("position", &self.position())
            .field("size", &self.size())
            .field("source_type", &self.source_type())
            .finish()
    }
}

/// The stream properties.
#[derive(Clone, Serialize, Deserialize, Type, Debug)]
#[zvariant(signature = "dict")]
struct StreamProperties {
    #[serde(default, with = "optional", skip_serializing_if = "Option::is_none")]
    position: Option<(i32, i32)>,
    #[serde(default, with = "optional", skip_serializing_if = "Option::is_none")]
    size: Option<(i32, i32)>,
    #[serde(default, with = "optional", skip_serializing_if = "Option::is_none")]
    source_type: Option<SourceType>,
}

/// A [builder-pattern] type to construct a PipeWire [`Stream`].
///
/// [builder-pattern]: https://doc.rust-lang.org/1.0.0/style/ownership/builders.html
pub struct StreamBuilder {
    stream: Stream,
}

impl StreamBuilder {
    /// Create a new instance of a stream builder.
    pub fn new(pipe_wire_node_id: u32) -> Self {
        Self {
            stream: Stream(
                pipe_wire_node_id,
                StreamProperties {
                    position: None,
                    size: None,
                    source_type: None,
                },
            ),
        }
    }

    /// Set the stream's optional position (in the compositor coordinate
    /// space).
    #[must_use]
    pub fn position(mut self, position: impl Into<Option<(i32, i32)>>) -> Self {
        self.stream.1.position = position.into();
        self
    }

    /// Set the stream's optional size (in the compositor coordinate space).
    #[must_use]
    pub fn size(mut self, size: impl Into<Option<(i32, i32)>>) -> Self {
        self.stream.1.size = size.into();
        self
    }

    /// Set the stream's optional source type.
    #[must_use]
    pub fn source_type(mut self, source_type: impl Into<Option<SourceType>>) -> Self {
        self.stream.1.source_type = source_type.into();
        self
    }

    /// Build the [`Stream`].
    pub fn build(self) -> Stream {
        self.stream
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn source_type_bits() {
        assert_eq!(BitFlags::from(SourceType::Monitor).bits(), 1);
        assert_eq!(BitFlags::from(SourceType::Window).bits(), 2);
        assert_eq!(BitFlags::from(SourceType::Virtual).bits(), 4);
        assert_eq!((SourceType::Monitor | SourceType::Window).bits(), 3);
    }

    #[test]
    fn cursor_mode_bits() {
        assert_eq!(BitFlags::from(CursorMode::Hidden).bits(), 1);
        assert_eq!(BitFlags::from(CursorMode::Embedded).bits(), 2);
        assert_eq!(BitFlags::from(CursorMode::Metadata).bits(), 4);
    }

    #[test]
    fn stream_builder() {
        let stream = StreamBuilder::new(42)
            .position((0, 0))
            .size((1920, 1080))
            .source_type(SourceType::Monitor)
            .build();
        assert_eq!(stream.pipe_wire_node_id(), 42);
        assert_eq!(stream.size(), Some((1920, 1080)));
        assert_eq!(stream.source_type(), Some(SourceType::Monitor));
    }
}
