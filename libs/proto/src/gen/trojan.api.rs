#[derive(Clone, Copy, PartialEq, ::prost::Message)]
pub struct Traffic {
    #[prost(uint64, tag = "1")]
    pub upload_traffic: u64,
    #[prost(uint64, tag = "2")]
    pub download_traffic: u64,
}
#[derive(Clone, Copy, PartialEq, ::prost::Message)]
pub struct Speed {
    #[prost(uint64, tag = "1")]
    pub upload_speed: u64,
    #[prost(uint64, tag = "2")]
    pub download_speed: u64,
}
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct User {
    #[prost(string, tag = "1")]
    pub password: ::prost::alloc::string::String,
    #[prost(string, tag = "2")]
    pub hash: ::prost::alloc::string::String,
}
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct UserStatus {
    #[prost(message, optional, tag = "1")]
    pub user: ::core::option::Option<User>,
    #[prost(message, optional, tag = "2")]
    pub traffic_total: ::core::option::Option<Traffic>,
    #[prost(message, optional, tag = "3")]
    pub speed_current: ::core::option::Option<Speed>,
    #[prost(message, optional, tag = "4")]
    pub speed_limit: ::core::option::Option<Speed>,
    #[prost(int32, tag = "5")]
    pub ip_current: i32,
    #[prost(int32, tag = "6")]
    pub ip_limit: i32,
}
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct GetUsersRequest {
    #[prost(message, optional, tag = "1")]
    pub user: ::core::option::Option<User>,
}
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct GetUsersResponse {
    #[prost(bool, tag = "1")]
    pub success: bool,
    #[prost(string, tag = "2")]
    pub info: ::prost::alloc::string::String,
    #[prost(message, optional, tag = "3")]
    pub status: ::core::option::Option<UserStatus>,
}
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SetUsersRequest {
    #[prost(message, optional, tag = "1")]
    pub status: ::core::option::Option<UserStatus>,
    #[prost(enumeration = "set_users_request::Operation", tag = "2")]
    pub operation: i32,
}
/// Nested message and enum types in `SetUsersRequest`.
pub mod set_users_request {
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
    #[repr(i32)]
    pub enum Operation {
        Add = 0,
        Delete = 1,
        Modify = 2,
    }
    impl Operation {
        /// String value of the enum field names used in the ProtoBuf definition.
        pub fn as_str_name(&self) -> &'static str {
            match self {
                Self::Add => "Add",
                Self::Delete => "Delete",
                Self::Modify => "Modify",
            }
        }
    }
}
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SetUsersResponse {
    #[prost(bool, tag = "1")]
    pub success: bool,
    #[prost(string, tag = "2")]
    pub info: ::prost::alloc::string::String,
}
#[derive(Clone, Copy, PartialEq, ::prost::Message)]
pub struct ListUsersRequest {}
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ListUsersResponse {
    #[prost(message, optional, tag = "1")]
    pub status: ::core::option::Option<UserStatus>,
}
/// Client for `trojan.api.TrojanServerService`.
pub mod trojan_server_service_client {
    #![allow(
        unused_variables,
        dead_code,
        missing_docs,
        clippy::wildcard_imports,
        clippy::let_unit_value
    )]
    use tonic::codegen::http::Uri;
    use tonic::codegen::*;
    #[derive(Debug, Clone)]
    pub struct TrojanServerServiceClient<T> {
        inner: tonic::client::Grpc<T>,
    }
    impl TrojanServerServiceClient<tonic::transport::Channel> {
        /// Attempt to create a new client by connecting to a given endpoint.
        pub async fn connect<D>(dst: D) -> Result<Self, tonic::transport::Error>
        where
            D: TryInto<tonic::transport::Endpoint>,
            D::Error: Into<StdError>,
        {
            let conn = tonic::transport::Endpoint::new(dst)?.connect().await?;
            Ok(Self::new(conn))
        }
    }
    impl<T> TrojanServerServiceClient<T>
    where
        T: tonic::client::GrpcService<tonic::body::BoxBody>,
        T::Error: Into<StdError>,
        T::ResponseBody: Body<Data = Bytes> + std::marker::Send + 'static,
        <T::ResponseBody as Body>::Error: Into<StdError> + std::marker::Send,
    {
        pub fn new(inner: T) -> Self {
            let inner = tonic::client::Grpc::new(inner);
            Self { inner }
        }
        pub fn with_origin(inner: T, origin: Uri) -> Self {
            let inner = tonic::client::Grpc::with_origin(inner, origin);
            Self { inner }
        }
        /// Limits the maximum size of a decoded message.
        #[must_use]
        pub fn max_decoding_message_size(mut self, limit: usize) -> Self {
            self.inner = self.inner.max_decoding_message_size(limit);
            self
        }
        pub async fn list_users(
            &mut self,
            request: impl tonic::IntoRequest<super::ListUsersRequest>,
        ) -> std::result::Result<
            tonic::Response<tonic::codec::Streaming<super::ListUsersResponse>>,
            tonic::Status,
        > {
            self.inner.ready().await.map_err(|e| {
                tonic::Status::unknown(format!("Service was not ready: {}", e.into()))
            })?;
            let codec = tonic::codec::ProstCodec::default();
            let path = http::uri::PathAndQuery::from_static(
                "/trojan.api.TrojanServerService/ListUsers",
            );
            let mut req = request.into_request();
            req.extensions_mut().insert(GrpcMethod::new(
                "trojan.api.TrojanServerService",
                "ListUsers",
            ));
            self.inner.server_streaming(req, path, codec).await
        }
        pub async fn get_users(
            &mut self,
            request: impl tonic::IntoStreamingRequest<Message = super::GetUsersRequest>,
        ) -> std::result::Result<
            tonic::Response<tonic::codec::Streaming<super::GetUsersResponse>>,
            tonic::Status,
        > {
            self.inner.ready().await.map_err(|e| {
                tonic::Status::unknown(format!("Service was not ready: {}", e.into()))
            })?;
            let codec = tonic::codec::ProstCodec::default();
            let path = http::uri::PathAndQuery::from_static(
                "/trojan.api.TrojanServerService/GetUsers",
            );
            let mut req = request.into_streaming_request();
            req.extensions_mut().insert(GrpcMethod::new(
                "trojan.api.TrojanServerService",
                "GetUsers",
            ));
            self.inner.streaming(req, path, codec).await
        }
        pub async fn set_users(
            &mut self,
            request: impl tonic::IntoStreamingRequest<Message = super::SetUsersRequest>,
        ) -> std::result::Result<
            tonic::Response<tonic::codec::Streaming<super::SetUsersResponse>>,
            tonic::Status,
        > {
            self.inner.ready().await.map_err(|e| {
                tonic::Status::unknown(format!("Service was not ready: {}", e.into()))
            })?;
            let codec = tonic::codec::ProstCodec::default();
            let path = http::uri::PathAndQuery::from_static(
                "/trojan.api.TrojanServerService/SetUsers",
            );
            let mut req = request.into_streaming_request();
            req.extensions_mut().insert(GrpcMethod::new(
                "trojan.api.TrojanServerService",
                "SetUsers",
            ));
            self.inner.streaming(req, path, codec).await
        }
    }
}
