#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

mod event;
pub mod metrics;
pub mod observe;
pub mod server;

pub use self::{observe::ProxyTap, server::ResourceTapServer};

/// Generated protobuf bindings.
///
/// Modules mirror protobuf package names so that cross-package references in
/// generated code resolve.
pub mod api {
    pub mod io {
        pub mod linkerd {
            pub mod proxy {
                pub mod tap {
                    tonic::include_proto!("io.linkerd.proxy.tap");
                }
            }
        }
    }

    pub mod linkerd2 {
        pub mod tap {
            tonic::include_proto!("linkerd2.tap");
        }
    }

    pub use self::{io::linkerd::proxy::tap as proxy, linkerd2::tap as public};
}
