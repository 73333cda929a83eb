mod health;
mod topups;

pub use health::health_check;
pub use topups::create_topup;
