// Interpreter tests over hand-assembled chunks
mod builder;

mod test_api;
mod test_closures;
mod test_coroutine;
mod test_dump;
mod test_pcall;
#[cfg(feature = "serde")]
mod test_serde;
mod test_vm;
