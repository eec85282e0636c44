//! `#[pg(...)]` attribute parsing.

use syn::{Attribute, Error, Field, Ident, LitStr, Result};

/// How a field's value is rendered and scanned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Codec {
    Plain,
    Array,
    Hstore,
    Json,
}

/// Options of one struct field.
#[derive(Debug)]
pub struct FieldAttrs {
    pub ident: Ident,
    /// Column / placeholder name.
    pub name: String,
    pub skip: bool,
    pub nullempty: bool,
    pub codec: Codec,
    pub sql_type: Option<String>,
    pub composite: Option<String>,
}

impl FieldAttrs {
    pub fn parse(field: &Field) -> Result<Self> {
        let Some(ident) = field.ident.clone() else {
            return Err(Error::new_spanned(field, "only named fields are supported"));
        };
        let mut out = Self {
            name: ident.to_string(),
            ident,
            skip: false,
            nullempty: false,
            codec: Codec::Plain,
            sql_type: None,
            composite: None,
        };

        for attr in pg_attrs(&field.attrs) {
            attr.parse_nested_meta(|meta| {
                if meta.path.is_ident("rename") {
                    let value: LitStr = meta.value()?.parse()?;
                    out.name = value.value();
                } else if meta.path.is_ident("skip") {
                    out.skip = true;
                } else if meta.path.is_ident("nullempty") {
                    out.nullempty = true;
                } else if meta.path.is_ident("array") {
                    out.set_codec(&meta.path, Codec::Array)?;
                } else if meta.path.is_ident("hstore") {
                    out.set_codec(&meta.path, Codec::Hstore)?;
                } else if meta.path.is_ident("composite") {
                    let value: LitStr = meta.value()?.parse()?;
                    out.composite = Some(value.value());
                } else if meta.path.is_ident("type") {
                    let value: LitStr = meta.value()?.parse()?;
                    let ty = value.value();
                    if ty == "json" || ty == "jsonb" {
                        out.set_codec(&meta.path, Codec::Json)?;
                    }
                    out.sql_type = Some(ty);
                } else if meta.path.is_ident("pk")
                    || meta.path.is_ident("soft_delete")
                    || meta.path.is_ident("json_use_number")
                {
                    // Informational for callers
                } else {
                    return Err(meta.error("unknown pg attribute"));
                }
                Ok(())
            })?;
        }
        Ok(out)
    }

    fn set_codec(&mut self, path: &syn::Path, codec: Codec) -> Result<()> {
        if self.codec != Codec::Plain && self.codec != codec {
            return Err(Error::new_spanned(path, "conflicting pg codecs"));
        }
        self.codec = codec;
        Ok(())
    }
}

/// Struct-level options: `#[pg(methods(full_name, age))]` exposes
/// no-argument methods as named parameters.
#[derive(Debug, Default)]
pub struct StructAttrs {
    pub methods: Vec<Ident>,
}

impl StructAttrs {
    pub fn parse(attrs: &[Attribute]) -> Result<Self> {
        let mut out = Self::default();
        for attr in pg_attrs(attrs) {
            attr.parse_nested_meta(|meta| {
                if meta.path.is_ident("methods") {
                    meta.parse_nested_meta(|method| {
                        match method.path.get_ident() {
                            Some(ident) => out.methods.push(ident.clone()),
                            None => return Err(method.error("expected a method name")),
                        }
                        Ok(())
                    })
                } else {
                    Err(meta.error("unknown pg attribute"))
                }
            })?;
        }
        Ok(out)
    }
}

fn pg_attrs(attrs: &[Attribute]) -> impl Iterator<Item = &Attribute> {
    attrs.iter().filter(|a| a.path().is_ident("pg"))
}
