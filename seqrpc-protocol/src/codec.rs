//! Codec abstraction and registry.
//!
//! A [`Codec`] turns headers and bodies into bytes and back. Bodies cross the
//! trait boundary type-erased (`erased_serde`), so one `Arc<dyn Codec>` can
//! serve every argument and reply type while callers still decode into a
//! concrete `T`.

use crate::error::CodecError;
use crate::header::Header;
use crate::option::CodecType;
use bincode::Options;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Callback handed a type-erased deserializer positioned at a body.
pub type BodyVisitor<'a> = &'a mut dyn for<'de> FnMut(
    &mut dyn erased_serde::Deserializer<'de>,
) -> Result<(), erased_serde::Error>;

/// Encoding format for headers and bodies.
pub trait Codec: Send + Sync + fmt::Debug {
    /// Tag this codec is registered under.
    fn codec_type(&self) -> CodecType;

    fn encode_header(&self, header: &Header) -> Result<Vec<u8>, CodecError>;

    fn decode_header(&self, bytes: &[u8]) -> Result<Header, CodecError>;

    fn encode_body(&self, body: &dyn erased_serde::Serialize) -> Result<Vec<u8>, CodecError>;

    /// Runs `visit` against a deserializer over `bytes`.
    fn decode_body(&self, bytes: &[u8], visit: BodyVisitor<'_>) -> Result<(), CodecError>;
}

impl dyn Codec {
    /// Decodes a body into a concrete type.
    pub fn decode_as<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T, CodecError> {
        let mut out = None;
        self.decode_body(bytes, &mut |de| {
            out = Some(erased_serde::deserialize::<T>(de)?);
            Ok(())
        })?;
        out.ok_or_else(|| CodecError::Decode("body produced no value".to_string()))
    }
}

/// Compact binary codec built on `bincode`.
#[derive(Debug, Default, Clone, Copy)]
pub struct BincodeCodec;

impl BincodeCodec {
    pub fn new() -> Self {
        Self
    }

    fn options() -> impl Options + Copy {
        bincode::DefaultOptions::new()
    }
}

impl Codec for BincodeCodec {
    fn codec_type(&self) -> CodecType {
        CodecType::bincode()
    }

    fn encode_header(&self, header: &Header) -> Result<Vec<u8>, CodecError> {
        Self::options().serialize(header).map_err(|e| {
            tracing::warn!("bincode codec: error encoding header: {}", e);
            CodecError::Encode(e.to_string())
        })
    }

    fn decode_header(&self, bytes: &[u8]) -> Result<Header, CodecError> {
        Self::options()
            .deserialize(bytes)
            .map_err(|e| CodecError::Decode(e.to_string()))
    }

    fn encode_body(&self, body: &dyn erased_serde::Serialize) -> Result<Vec<u8>, CodecError> {
        Self::options().serialize(body).map_err(|e| {
            tracing::warn!("bincode codec: error encoding body: {}", e);
            CodecError::Encode(e.to_string())
        })
    }

    fn decode_body(&self, bytes: &[u8], visit: BodyVisitor<'_>) -> Result<(), CodecError> {
        let mut de = bincode::Deserializer::from_slice(bytes, Self::options());
        let mut erased = <dyn erased_serde::Deserializer>::erase(&mut de);
        visit(&mut erased).map_err(|e| CodecError::Decode(e.to_string()))
    }
}

type CodecConstructor = Box<dyn Fn() -> Arc<dyn Codec> + Send + Sync>;

/// Maps codec tags to constructors.
///
/// Built once at startup and shared by servers and clients. Adding a wire
/// format means registering another constructor here.
pub struct CodecRegistry {
    constructors: HashMap<CodecType, CodecConstructor>,
}

impl CodecRegistry {
    /// Creates a registry with no codecs.
    pub fn empty() -> Self {
        Self {
            constructors: HashMap::new(),
        }
    }

    /// Registers a constructor, replacing any previous one for the same tag.
    pub fn register<F>(&mut self, codec_type: CodecType, constructor: F) -> &mut Self
    where
        F: Fn() -> Arc<dyn Codec> + Send + Sync + 'static,
    {
        self.constructors.insert(codec_type, Box::new(constructor));
        self
    }

    /// Builds the codec registered for `codec_type`.
    pub fn get(&self, codec_type: &CodecType) -> Option<Arc<dyn Codec>> {
        self.constructors.get(codec_type).map(|ctor| ctor())
    }

    pub fn contains(&self, codec_type: &CodecType) -> bool {
        self.constructors.contains_key(codec_type)
    }

    /// Drops every codec whose tag does not satisfy `keep`.
    pub fn retain<F>(&mut self, mut keep: F) -> &mut Self
    where
        F: FnMut(&CodecType) -> bool,
    {
        self.constructors.retain(|codec_type, _| keep(codec_type));
        self
    }

    /// Returns the registered tags.
    pub fn types(&self) -> Vec<CodecType> {
        let mut types: Vec<_> = self.constructors.keys().cloned().collect();
        types.sort_by(|a, b| a.as_str().cmp(b.as_str()));
        types
    }
}

impl Default for CodecRegistry {
    /// Registry holding the bundled bincode codec.
    fn default() -> Self {
        let mut registry = Self::empty();
        registry.register(CodecType::bincode(), || Arc::new(BincodeCodec::new()));
        registry
    }
}

impl fmt::Debug for CodecRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CodecRegistry")
            .field("types", &self.types())
            .finish()
    }
}
