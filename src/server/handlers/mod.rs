pub mod health;
pub mod share;
pub mod video;
