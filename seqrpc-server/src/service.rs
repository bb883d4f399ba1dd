//! Service-dispatch contract.
//!
//! The serve loop hands every request to a [`Service`]. The service decides the
//! argument type (through [`Args::decode`]) and produces a [`Reply`] or a
//! [`ServiceError`]. Calls run on the blocking pool, so a service may block, and
//! a panic is reported to the caller as an error response.

use crate::error::ServiceError;
use bytes::Bytes;
use seqrpc_protocol::{Codec, Header};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Still-encoded request arguments.
#[derive(Clone)]
pub struct Args {
    codec: Arc<dyn Codec>,
    body: Bytes,
}

impl Args {
    pub fn new(codec: Arc<dyn Codec>, body: Bytes) -> Self {
        Self { codec, body }
    }

    /// Decodes the arguments with the connection's codec.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, ServiceError> {
        self.codec
            .decode_as(&self.body)
            .map_err(|e| ServiceError::InvalidArgument(e.to_string()))
    }
}

impl fmt::Debug for Args {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Args")
            .field("codec", &self.codec.codec_type())
            .field("len", &self.body.len())
            .finish()
    }
}

/// One inbound request.
#[derive(Debug, Clone)]
pub struct Request {
    pub header: Header,
    pub args: Args,
}

impl Request {
    pub fn new(header: Header, args: Args) -> Self {
        Self { header, args }
    }

    pub fn service_method(&self) -> &str {
        &self.header.service_method
    }

    pub fn seq(&self) -> u64 {
        self.header.seq
    }
}

/// A reply value, encoded later by the connection's codec.
pub struct Reply(Box<dyn erased_serde::Serialize + Send + Sync>);

impl Reply {
    pub fn new<T>(value: T) -> Self
    where
        T: Serialize + Send + Sync + 'static,
    {
        Self(Box::new(value))
    }

    pub fn body(&self) -> &(dyn erased_serde::Serialize + Sync) {
        &*self.0
    }
}

impl fmt::Debug for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Reply(..)")
    }
}

/// Resolves a request to a reply.
pub trait Service: Send + Sync + 'static {
    fn call(&self, request: &Request) -> Result<Reply, ServiceError>;
}

impl<F> Service for F
where
    F: Fn(&Request) -> Result<Reply, ServiceError> + Send + Sync + 'static,
{
    fn call(&self, request: &Request) -> Result<Reply, ServiceError> {
        self(request)
    }
}

type Handler = Box<dyn Fn(&Request) -> Result<Reply, ServiceError> + Send + Sync>;

/// Table of typed handlers keyed by `"Service.Method"`.
#[derive(Default)]
pub struct Methods {
    handlers: HashMap<String, Handler>,
}

impl Methods {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a handler taking decoded arguments of type `A`.
    ///
    /// An `Err(message)` from the handler becomes the response header's error.
    pub fn register<A, R, F>(&mut self, service_method: impl Into<String>, handler: F) -> &mut Self
    where
        A: DeserializeOwned,
        R: Serialize + Send + Sync + 'static,
        F: Fn(A) -> Result<R, String> + Send + Sync + 'static,
    {
        let handler: Handler = Box::new(move |request: &Request| {
            let args = request.args.decode::<A>()?;
            handler(args).map(Reply::new).map_err(ServiceError::Failed)
        });
        self.handlers.insert(service_method.into(), handler);
        self
    }

    pub fn contains(&self, service_method: &str) -> bool {
        self.handlers.contains_key(service_method)
    }

    /// Returns registered method names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<_> = self.handlers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl Service for Methods {
    fn call(&self, request: &Request) -> Result<Reply, ServiceError> {
        if request.header.split_method().is_none() {
            return Err(ServiceError::IllFormed(request.service_method().to_string()));
        }
        let handler = self
            .handlers
            .get(request.service_method())
            .ok_or_else(|| ServiceError::MethodNotFound(request.service_method().to_string()))?;
        handler(request)
    }
}

impl fmt::Debug for Methods {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Methods")
            .field("names", &self.names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use seqrpc_protocol::BincodeCodec;

    fn request<T: Serialize>(method: &str, seq: u64, args: &T) -> Request {
        let codec: Arc<dyn Codec> = Arc::new(BincodeCodec::new());
        let body = codec.encode_body(args).unwrap();
        Request::new(Header::new(method, seq), Args::new(codec, Bytes::from(body)))
    }

    fn encoded(reply: &Reply) -> Vec<u8> {
        BincodeCodec::new().encode_body(reply.body()).unwrap()
    }

    #[test]
    fn test_args_decode() {
        let req = request("User.Sum", 1, &(3i32, 4i32));
        let (a, b): (i32, i32) = req.args.decode().unwrap();
        assert_eq!(a + b, 7);
    }

    #[test]
    fn test_args_decode_wrong_type() {
        let req = request("User.Sum", 1, &());
        let result: Result<String, _> = req.args.decode();
        assert!(matches!(result, Err(ServiceError::InvalidArgument(_))));
    }

    #[test]
    fn test_methods_dispatch() {
        let mut methods = Methods::new();
        methods.register("User.Sum", |(a, b): (i32, i32)| Ok(a + b));

        let reply = methods.call(&request("User.Sum", 1, &(2i32, 5i32))).unwrap();
        assert_eq!(encoded(&reply), BincodeCodec::new().encode_body(&7i32).unwrap());
    }

    #[test]
    fn test_methods_not_found() {
        let methods = Methods::new();
        let err = methods.call(&request("User.Nope", 1, &())).unwrap_err();
        assert_eq!(err, ServiceError::MethodNotFound("User.Nope".into()));
    }

    #[test]
    fn test_methods_ill_formed_name() {
        let mut methods = Methods::new();
        methods.register("Sum", |_: ()| Ok(()));
        for name in ["Sum", "User.", ".Sum"] {
            let err = methods.call(&request(name, 1, &())).unwrap_err();
            assert_eq!(err, ServiceError::IllFormed(name.into()));
        }
    }

    #[test]
    fn test_methods_handler_error() {
        let mut methods = Methods::new();
        methods.register("User.Div", |(a, b): (i32, i32)| {
            if b == 0 {
                Err("divide by zero".to_string())
            } else {
                Ok(a / b)
            }
        });
        let err = methods.call(&request("User.Div", 1, &(1i32, 0i32))).unwrap_err();
        assert_eq!(err, ServiceError::failed("divide by zero"));
    }

    #[test]
    fn test_methods_names() {
        let mut methods = Methods::new();
        methods
            .register("B.Two", |_: ()| Ok(()))
            .register("A.One", |_: ()| Ok(()));
        assert_eq!(methods.names(), vec!["A.One", "B.Two"]);
        assert!(methods.contains("A.One"));
        assert!(!methods.contains("C.Three"));
    }

    #[test]
    fn test_closure_service() {
        let service = |req: &Request| -> Result<Reply, ServiceError> {
            Ok(Reply::new(format!("rpc resp {}", req.seq())))
        };
        let reply = Service::call(&service, &request("User.Sum", 3, &())).unwrap();
        assert_eq!(
            encoded(&reply),
            BincodeCodec::new().encode_body(&"rpc resp 3").unwrap()
        );
    }
}
