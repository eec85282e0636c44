//! Derive macros for pgkit.
//!
//! - `#[derive(Params)]` lets a struct resolve `?name` placeholders and
//!   render as a composite literal.
//! - `#[derive(FromRow)]` builds a struct from a row by column name.
//!
//! # Field attributes
//!
//! - `#[pg(rename = "col")]` - Column / placeholder name
//! - `#[pg(skip)]` - Ignore the field (`Default` when scanning)
//! - `#[pg(nullempty)]` - Render a zero value as `NULL`
//! - `#[pg(array)]` - Use the array codec
//! - `#[pg(hstore)]` - Use the hstore codec
//! - `#[pg(type = "jsonb")]` - Explicit SQL type; `json`/`jsonb` use the JSON codec
//! - `#[pg(composite = "name")]` - Composite type name
//! - `#[pg(pk)]`, `#[pg(soft_delete)]`, `#[pg(json_use_number)]` - Accepted, informational
//!
//! # Struct attributes
//!
//! - `#[pg(methods(full_name))]` - Resolve `?full_name` by calling `self.full_name()`

use proc_macro::TokenStream;
use syn::{parse_macro_input, DeriveInput};

mod attr;
mod from_row;
mod params;

/// Derive macro for `NamedParams` and `Append`.
///
/// ```ignore
/// #[derive(Params)]
/// #[pg(methods(display_name))]
/// struct User {
///     id: i64,
///     #[pg(rename = "user_name", nullempty)]
///     name: String,
///     #[pg(array)]
///     tags: Vec<String>,
/// }
///
/// db.exec("UPDATE users SET name = ?user_name WHERE id = ?id", &[&user]).await?;
/// ```
#[proc_macro_derive(Params, attributes(pg))]
pub fn derive_params(input: TokenStream) -> TokenStream {
    match params::params(parse_macro_input!(input as DeriveInput)) {
        Ok(ok) => ok.into(),
        Err(err) => err.into_compile_error().into(),
    }
}

/// Derive macro for `FromRow`.
#[proc_macro_derive(FromRow, attributes(pg))]
pub fn derive_from_row(input: TokenStream) -> TokenStream {
    match from_row::from_row(parse_macro_input!(input as DeriveInput)) {
        Ok(ok) => ok.into(),
        Err(err) => err.into_compile_error().into(),
    }
}
