pub mod handler;
pub mod models;

#[cfg(test)]
mod tests;

pub use handler::AppState;
