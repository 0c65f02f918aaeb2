//! Busline Core — channel descriptors, payloads, request fingerprints and
//! invocation contexts shared by the request runtime.

pub mod channel;
pub mod context;
pub mod hash;
pub mod types;

pub use channel::{
    AuthResult, CacheConfig, CacheType, ChannelDescriptor, ChannelInfo, ChannelType,
    ContentEncoding, DataFormat, ParamsPriority, SecurityDescriptor, SecurityInfo, SecurityType,
    Transport,
};
pub use context::{CallbackEnvironment, InvocationContext};
pub use hash::{cache_key, new_cid, request_fingerprint};
pub use types::{CacheEntry, ChannelParams, ParamValue, Payload};

#[cfg(test)]
mod tests {
    #[test]
    fn crate_loads() {
        // Empty body: if this test runs, the crate compiles and loads.
    }
}
