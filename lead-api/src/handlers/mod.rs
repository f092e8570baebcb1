mod app;
mod imports;
mod sources;
mod webhooks;

pub use app::add_routes;
