pub mod ban_policy;

pub use ban_policy::BanPolicy;
