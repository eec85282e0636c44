use proc_macro2::TokenStream;
use quote::quote;
use syn::{Data, DeriveInput, Error, Fields, Result};

use crate::attr::{Codec, FieldAttrs};

pub fn from_row(input: DeriveInput) -> Result<TokenStream> {
    let DeriveInput {
        ident,
        generics,
        data,
        ..
    } = input;
    let Data::Struct(data) = data else {
        return Err(Error::new_spanned(&ident, "FromRow can only be derived for structs"));
    };
    let Fields::Named(named) = data.fields else {
        return Err(Error::new_spanned(&ident, "FromRow requires named fields"));
    };

    let mut inits = Vec::with_capacity(named.named.len());
    for field in &named.named {
        let f = FieldAttrs::parse(field)?;
        let ident = &f.ident;
        if f.skip {
            inits.push(quote! { #ident: ::std::default::Default::default() });
            continue;
        }

        let ty = &field.ty;
        let name = &f.name;
        let init = match f.codec {
            Codec::Plain => quote! { row.get::<#ty, &str>(#name)? },
            Codec::Array => quote! { row.get::<::pgkit::types::Array<#ty>, &str>(#name)?.0 },
            Codec::Hstore => quote! { row.get::<::pgkit::types::Hstore<#ty>, &str>(#name)?.0 },
            Codec::Json => quote! { row.get::<::pgkit::types::Json<#ty>, &str>(#name)?.0 },
        };
        inits.push(quote! { #ident: #init });
    }

    let (impl_generics, ty_generics, where_clause) = generics.split_for_impl();

    Ok(quote! {
        impl #impl_generics ::pgkit::FromRow for #ident #ty_generics #where_clause {
            fn from_row(row: &::pgkit::Row) -> ::pgkit::Result<Self> {
                ::std::result::Result::Ok(Self {
                    #(#inits),*
                })
            }
        }
    })
}
