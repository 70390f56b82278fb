// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Proc macro for the `#[test]` attribute exported by `test_with_tracing`.
//!
//! The attribute expands to the standard `#[test]` attribute and prepends a
//! call to `test_with_tracing::init()` to the test body, so every test runs
//! with a `tracing` subscriber writing to the test output.
//!
//! ```ignore
//! use test_with_tracing::test;
//!
//! #[test]
//! fn import_key() {
//!     tracing::debug!("visible in the captured test output");
//! }
//! ```

use proc_macro::TokenStream;
use quote::quote;
use syn::parse_macro_input;
use syn::spanned::Spanned;
use syn::ItemFn;

/// Attribute macro that defines a test with tracing output enabled.
///
/// Accepts no arguments. Works for tests returning `()` and tests returning a
/// `Result`.
#[proc_macro_attribute]
pub fn test(attr: TokenStream, item: TokenStream) -> TokenStream {
    if !attr.is_empty() {
        let attr = proc_macro2::TokenStream::from(attr);
        return syn::Error::new(attr.span(), "#[test] does not take arguments")
            .to_compile_error()
            .into();
    }

    let ItemFn {
        attrs,
        vis,
        sig,
        block,
    } = parse_macro_input!(item as ItemFn);

    if !sig.inputs.is_empty() {
        return syn::Error::new(sig.inputs.span(), "test functions take no arguments")
            .to_compile_error()
            .into();
    }

    let name = &sig.ident;
    let output = &sig.output;

    quote! {
        #[::core::prelude::v1::test]
        #(#attrs)*
        #vis fn #name() #output {
            ::test_with_tracing::init();
            #block
        }
    }
    .into()
}
