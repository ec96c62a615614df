//! `#[derive(GcTraceable)]` for `lifecycle-bridge` payload types.
//!
//! The derived `external_memory_size()` sums the fields marked
//! `#[gc(track)]`. For enums, the tracked fields of the active variant are
//! summed.
//!
//! ```ignore
//! use lifecycle_bridge::GcTraceable;
//!
//! #[derive(GcTraceable)]
//! struct Frame {
//!     #[gc(track)]
//!     pixels: Vec<u8>,
//!     width: u32,
//! }
//!
//! #[derive(GcTraceable)]
//! enum Body {
//!     Empty,
//!     Text(#[gc(track)] String),
//!     Chunks { #[gc(track)] parts: Vec<bytes::Bytes> },
//! }
//! ```
//!
//! Inside `lifecycle-bridge` itself, use `#[gc(crate_path = "crate")]` on the
//! type.

use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::{format_ident, quote};
use syn::{Data, DeriveInput, Fields, parse_macro_input};

/// Derive `GcTraceable`.
///
/// # Attributes
///
/// - `#[gc(track)]` on a field: count its `external_memory_size()`
/// - `#[gc(crate_path = "path")]` on the type: path of the crate exporting
///   the trait (default: `lifecycle_bridge`)
#[proc_macro_derive(GcTraceable, attributes(gc))]
pub fn derive_gc_traceable(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);

    match expand(&input) {
        Ok(tokens) => tokens.into(),
        Err(err) => err.to_compile_error().into(),
    }
}

fn expand(input: &DeriveInput) -> syn::Result<TokenStream2> {
    let name = &input.ident;
    let (impl_generics, ty_generics, where_clause) = input.generics.split_for_impl();
    let crate_path = crate_path(input)?;

    let body = match &input.data {
        Data::Struct(data) => {
            let (pattern, sizes) = destructure(&data.fields, &crate_path)?;
            quote! {
                let #name #pattern = self;
                0usize #(+ #sizes)*
            }
        }
        Data::Enum(data) => {
            let mut arms = Vec::with_capacity(data.variants.len());

            for variant in &data.variants {
                let ident = &variant.ident;
                let (pattern, sizes) = destructure(&variant.fields, &crate_path)?;
                arms.push(quote! { #name::#ident #pattern => 0usize #(+ #sizes)* });
            }

            if arms.is_empty() {
                quote! { 0 }
            } else {
                quote! {
                    match self {
                        #(#arms,)*
                    }
                }
            }
        }
        Data::Union(_) => {
            return Err(syn::Error::new_spanned(
                input,
                "GcTraceable cannot be derived for unions",
            ));
        }
    };

    Ok(quote! {
        impl #impl_generics #crate_path::GcTraceable for #name #ty_generics #where_clause {
            #[allow(unused_variables)]
            fn external_memory_size(&self) -> usize {
                #body
            }
        }
    })
}

fn crate_path(input: &DeriveInput) -> syn::Result<TokenStream2> {
    let mut path = None;

    for attr in &input.attrs {
        if !attr.path().is_ident("gc") {
            continue;
        }

        attr.parse_nested_meta(|meta| {
            if meta.path.is_ident("crate_path") {
                let value: syn::LitStr = meta.value()?.parse()?;
                let parsed: syn::Path = value.parse()?;
                path = Some(quote! { #parsed });
                Ok(())
            } else {
                Err(meta.error("expected `crate_path = \"...\"`"))
            }
        })?;
    }

    Ok(path.unwrap_or_else(|| quote! { lifecycle_bridge }))
}

/// Binding pattern for `fields` plus the size expression of each tracked
/// binding.
fn destructure(fields: &Fields, crate_path: &TokenStream2) -> syn::Result<(TokenStream2, Vec<TokenStream2>)> {
    let mut sizes = Vec::new();

    let pattern = match fields {
        Fields::Named(named) => {
            let mut bindings = Vec::new();

            for field in &named.named {
                let ident = &field.ident;

                if is_tracked(field)? {
                    bindings.push(quote! { #ident });
                    sizes.push(quote! { #crate_path::GcTraceable::external_memory_size(#ident) });
                }
            }

            quote! { { #(#bindings,)* .. } }
        }
        Fields::Unnamed(unnamed) => {
            let mut bindings = Vec::new();

            for (i, field) in unnamed.unnamed.iter().enumerate() {
                if is_tracked(field)? {
                    let binding = format_ident!("field_{}", i);
                    sizes.push(quote! { #crate_path::GcTraceable::external_memory_size(#binding) });
                    bindings.push(quote! { #binding });
                } else {
                    bindings.push(quote! { _ });
                }
            }

            quote! { ( #(#bindings),* ) }
        }
        Fields::Unit => quote! {},
    };

    Ok((pattern, sizes))
}

fn is_tracked(field: &syn::Field) -> syn::Result<bool> {
    let mut tracked = false;

    for attr in &field.attrs {
        if !attr.path().is_ident("gc") {
            continue;
        }

        attr.parse_nested_meta(|meta| {
            if meta.path.is_ident("track") {
                tracked = true;
                Ok(())
            } else {
                Err(meta.error("expected `track`"))
            }
        })?;
    }

    Ok(tracked)
}
