//! trojan-go API bindings.
//!
//! Message and client definitions for `trojan.api.TrojanServerService`
//! (see `api/proto/trojan/api.proto`). Only the client side is needed: the
//! proxy process hosts the server.
//!
//! `src/gen` is checked in. Build with `SSMGR_PROTO_REGEN=1` (and `protoc`
//! on the path) to regenerate it after editing the proto.

pub mod trojan {
    pub mod api {
        include!("gen/trojan.api.rs");

        pub use trojan_server_service_client::TrojanServerServiceClient;
    }
}
