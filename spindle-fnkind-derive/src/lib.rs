//! A derive macro for the `FnKind` trait.
//!
//! A transformation registry is an enum whose variants each wrap exactly one
//! `PartitionFn`. Deriving `FnKind` on it lets composed functions be shipped
//! to workers as plain serialized data: the worker deserializes the registry
//! enum and dispatches on the variant, so no closure ever has to be
//! serialized.
//!
//! # Implementation details
//!
//! For every variant, the generated code
//! - forwards erased application to `transform::apply_erased`, which
//!   un-erases records into the variant's `Input` type and erases its
//!   `Output` records again;
//! - decodes input batches and encodes output batches with the variant's
//!   concrete `Input` / `Output` types;
//! - emits a `From<Variant>` impl so typed pipelines can lift a function into
//!   its registry.
extern crate proc_macro;

use proc_macro::TokenStream;
use quote::quote;
use syn::{parse_macro_input, Attribute, Data, DeriveInput, Error, Fields, Result, Type};

/// Check if the `internal` attribute is present on the derive macro.
///
/// Quoted paths need to be slightly modified if the macro is being called
/// from the `spindle` crate itself.
fn get_is_internal(attrs: &mut Vec<Attribute>) -> Result<bool> {
    let mut is_internal = None;
    let mut errors: Option<Error> = None;

    attrs.retain(|attr| {
        if !attr.path().is_ident("spindle") {
            return true;
        }
        if let Err(err) = attr.parse_nested_meta(|meta| {
            if meta.path.is_ident("internal") {
                if is_internal.is_some() {
                    return Err(meta.error("duplicate spindle crate attribute"));
                }

                is_internal = Some(true);
                Ok(())
            } else {
                Err(meta.error("unsupported spindle attribute"))
            }
        }) {
            match &mut errors {
                None => errors = Some(err),
                Some(errors) => errors.combine(err),
            }
        }
        false
    });

    match errors {
        None => Ok(is_internal.unwrap_or(false)),
        Some(errors) => Err(errors),
    }
}

/// Collect `(variant ident, wrapped type)` pairs, rejecting variants that
/// don't wrap exactly one unnamed field.
fn registry_variants(input: &DeriveInput) -> Result<Vec<(syn::Ident, Type)>> {
    let Data::Enum(data) = &input.data else {
        return Err(Error::new_spanned(
            &input.ident,
            "FnKind can only be derived for enums",
        ));
    };

    data.variants
        .iter()
        .map(|variant| match &variant.fields {
            Fields::Unnamed(fields) if fields.unnamed.len() == 1 => {
                Ok((variant.ident.clone(), fields.unnamed[0].ty.clone()))
            }
            _ => Err(Error::new_spanned(
                variant,
                "FnKind variants must wrap exactly one transformation, e.g. `Double(Double)`",
            )),
        })
        .collect()
}

/// See the [module level documentation](crate) for more information.
#[proc_macro_derive(FnKind, attributes(spindle))]
pub fn fn_kind_derive(input: TokenStream) -> TokenStream {
    let mut input = parse_macro_input!(input as DeriveInput);

    let is_internal = match get_is_internal(&mut input.attrs) {
        Ok(path) => path,
        Err(err) => return err.to_compile_error().into(),
    };

    let variants = match registry_variants(&input) {
        Ok(variants) => variants,
        Err(err) => return err.to_compile_error().into(),
    };

    // The path to the `spindle` crate.
    // If the derive macro is being called from the `spindle` crate itself, then
    // the path is `crate`, otherwise it is `::spindle`.
    let spindle_path = if is_internal {
        quote! { crate }
    } else {
        quote! { ::spindle }
    };

    let name = &input.ident;
    let (impl_generics, ty_generics, where_clause) = input.generics.split_for_impl();

    let idents: Vec<_> = variants.iter().map(|(ident, _)| ident).collect();
    let types: Vec<_> = variants.iter().map(|(_, ty)| ty).collect();
    let names: Vec<_> = idents.iter().map(|ident| ident.to_string()).collect();

    let expanded = quote! {
        impl #impl_generics #spindle_path::transform::FnKind for #name #ty_generics #where_clause {
            fn name(&self) -> &'static str {
                match self {
                    #( Self::#idents(_) => #names, )*
                }
            }

            fn apply_erased<'a>(
                &'a self,
                split: usize,
                input: #spindle_path::transform::ErasedStream<'a>,
            ) -> #spindle_path::transform::ErasedStream<'a> {
                match self {
                    #( Self::#idents(f) => #spindle_path::transform::apply_erased(f, split, input), )*
                }
            }

            fn decode_input(
                &self,
                serializer: #spindle_path::serializer::Serializer,
                batch: &[u8],
            ) -> #spindle_path::__private::anyhow::Result<::std::vec::Vec<#spindle_path::transform::Record>> {
                match self {
                    #( Self::#idents(_) => #spindle_path::transform::decode_batch::<#types>(serializer, batch), )*
                }
            }

            fn encode_output(
                &self,
                serializer: #spindle_path::serializer::Serializer,
                records: ::std::vec::Vec<#spindle_path::transform::Record>,
            ) -> #spindle_path::__private::anyhow::Result<::std::vec::Vec<u8>> {
                match self {
                    #( Self::#idents(_) => #spindle_path::transform::encode_batch::<#types>(serializer, records), )*
                }
            }
        }

        #(
            impl #impl_generics ::std::convert::From<#types> for #name #ty_generics #where_clause {
                fn from(f: #types) -> Self {
                    Self::#idents(f)
                }
            }
        )*
    };

    TokenStream::from(expanded)
}
