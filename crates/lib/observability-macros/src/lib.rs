//! `#[obs]`: opt-in tracing spans for engine hot paths.
//!
//! `#[obs]` expands to a `tracing::instrument` attribute gated on the calling
//! crate's `observability` feature, so builds without the feature carry no
//! span overhead. Bare identifiers passed to the attribute are recorded as
//! span fields taken from the function arguments of the same name:
//!
//! ```ignore
//! #[obs(cycle)]
//! async fn dispatch(&mut self, cycle: u64) { /* ... */ }
//! ```

use proc_macro::TokenStream;
use quote::quote;
use syn::punctuated::Punctuated;
use syn::{Ident, ItemFn, Token, parse_macro_input};

#[proc_macro_attribute]
pub fn obs(args: TokenStream, input: TokenStream) -> TokenStream {
    let mut item = parse_macro_input!(input as ItemFn);
    let fields = parse_macro_input!(args with Punctuated::<Ident, Token![,]>::parse_terminated);

    let attr = if fields.is_empty() {
        syn::parse_quote!(
            #[cfg_attr(feature = "observability", tracing::instrument(level = "trace", skip_all))]
        )
    } else {
        let names = fields.iter();
        let values = fields.iter();
        syn::parse_quote!(
            #[cfg_attr(
                feature = "observability",
                tracing::instrument(level = "trace", skip_all, fields(#(#names = #values),*))
            )]
        )
    };
    item.attrs.push(attr);
    TokenStream::from(quote!(#item))
}
