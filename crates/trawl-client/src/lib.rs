pub mod fetcher;
pub mod parse;
pub mod sites;

pub use fetcher::ReqwestFetcher;
pub use sites::{GenericRules, SelectorRules, SiteProfile, register_builtin_sites};
