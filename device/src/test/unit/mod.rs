mod platform;
mod stream;
mod tensor;
