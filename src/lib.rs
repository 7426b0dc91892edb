pub mod v1;

pub mod prelude {
    pub use crate::v1::aws::{
        wafregional::{ip_set::*, rule::*, *},
        *,
    };
    pub use crate::v1::cloud::*;
    pub use crate::v1::resource::{ResourceState::*, *};
    pub use crate::v1::token::*;
}
