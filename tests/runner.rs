//! Entry point for the crate's integration test binary (`[[test]] name =
//! "runner"` in `Cargo.toml`, matching `jj-lib-tests`' own `autotests =
//! false` + single-binary layout): each `test_*` module below is a sibling
//! file under `tests/`.

mod test_codec;
mod test_mapper;
mod test_overlay;
