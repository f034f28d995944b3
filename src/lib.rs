pub mod adapters;
pub mod app;
pub mod domain;

#[cfg(test)]
mod test_support;
