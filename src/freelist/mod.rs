pub mod pages_list;
pub mod reuse_bag;
pub mod stripe;

pub use pages_list::{
    default_max_stripes_per_bucket, PagesList, PagesListConfig, ReuseList,
    DEFAULT_TRY_LOCK_ATTEMPTS,
};
pub use reuse_bag::ReuseBag;
pub use stripe::Stripe;
