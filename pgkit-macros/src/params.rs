use proc_macro2::TokenStream;
use quote::quote;
use syn::{Data, DeriveInput, Error, Fields, Result};

use crate::attr::{Codec, FieldAttrs, StructAttrs};

pub fn params(input: DeriveInput) -> Result<TokenStream> {
    let DeriveInput {
        attrs,
        ident,
        generics,
        data,
        ..
    } = input;
    let Data::Struct(data) = data else {
        return Err(Error::new_spanned(&ident, "Params can only be derived for structs"));
    };
    let Fields::Named(named) = data.fields else {
        return Err(Error::new_spanned(&ident, "Params requires named fields"));
    };

    let st = StructAttrs::parse(&attrs)?;
    let fields = named
        .named
        .iter()
        .map(FieldAttrs::parse)
        .collect::<Result<Vec<_>>>()?;
    let fields: Vec<_> = fields.into_iter().filter(|f| !f.skip).collect();

    let field_arms = fields.iter().map(|f| {
        let name = &f.name;
        let value = value_expr(f);
        quote! {
            #name => {
                ::pgkit::types::Append::append_value(&#value, dst, flags);
                true
            }
        }
    });
    let method_arms = st.methods.iter().map(|m| {
        let name = m.to_string();
        quote! {
            #name => {
                ::pgkit::types::Append::append_value(&self.#m(), dst, flags);
                true
            }
        }
    });
    let composite_fields = fields.iter().map(|f| {
        let value = value_expr(f);
        quote! { &#value }
    });
    let infos = fields.iter().map(field_info);

    let type_name = ident.to_string();
    let (impl_generics, ty_generics, where_clause) = generics.split_for_impl();

    Ok(quote! {
        impl #impl_generics ::pgkit::types::NamedParams for #ident #ty_generics #where_clause {
            fn append_param(
                &self,
                dst: &mut ::std::vec::Vec<u8>,
                name: &str,
                flags: ::pgkit::types::Flags,
            ) -> bool {
                match name {
                    #(#field_arms)*
                    #(#method_arms)*
                    _ => false,
                }
            }

            fn type_name(&self) -> &'static str {
                #type_name
            }

            fn fields(&self) -> &'static [::pgkit::types::FieldInfo] {
                const FIELDS: &[::pgkit::types::FieldInfo] = &[#(#infos),*];
                FIELDS
            }
        }

        impl #impl_generics ::pgkit::types::Append for #ident #ty_generics #where_clause {
            fn append_value(&self, dst: &mut ::std::vec::Vec<u8>, flags: ::pgkit::types::Flags) {
                ::pgkit::types::append_composite(dst, flags, &[#(#composite_fields),*]);
            }

            fn as_named(&self) -> ::std::option::Option<&dyn ::pgkit::types::NamedParams> {
                ::std::option::Option::Some(self)
            }
        }
    })
}

/// Expression rendering the field through its codec. `nullempty` fields
/// become `None` when zero.
fn value_expr(f: &FieldAttrs) -> TokenStream {
    let ident = &f.ident;
    let wrapped = match f.codec {
        Codec::Plain => quote! { &self.#ident },
        Codec::Array => quote! { ::pgkit::types::Array(&self.#ident) },
        Codec::Hstore => quote! { ::pgkit::types::Hstore(&self.#ident) },
        Codec::Json => quote! { ::pgkit::types::Json(&self.#ident) },
    };
    if !f.nullempty {
        return wrapped;
    }
    quote! {
        {
            let v = #wrapped;
            if ::pgkit::types::Append::is_zero(&v) {
                ::std::option::Option::None
            } else {
                ::std::option::Option::Some(v)
            }
        }
    }
}

fn field_info(f: &FieldAttrs) -> TokenStream {
    let name = &f.name;
    let array = f.codec == Codec::Array;
    let hstore = f.codec == Codec::Hstore;
    let nullempty = f.nullempty;
    let sql_type = match &f.sql_type {
        Some(t) => quote! { ::std::option::Option::Some(#t) },
        None => quote! { ::std::option::Option::None },
    };
    let composite = match &f.composite {
        Some(t) => quote! { ::std::option::Option::Some(#t) },
        None => quote! { ::std::option::Option::None },
    };
    quote! {
        ::pgkit::types::FieldInfo {
            name: #name,
            sql_type: #sql_type,
            array: #array,
            hstore: #hstore,
            nullempty: #nullempty,
            composite: #composite,
        }
    }
}
