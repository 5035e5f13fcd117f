pub mod hasher;
pub mod loader;
pub mod locator;
