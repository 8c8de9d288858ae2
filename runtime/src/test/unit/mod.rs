mod compilation_cache;
mod interpreter;
mod platform;
