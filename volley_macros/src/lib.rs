use proc_macro::TokenStream;
use quote::quote;
use syn::{ItemFn, ReturnType, parse_macro_input, parse_quote};

extern crate proc_macro;

/// Turns an `async fn(&mut Vu) -> IterationResult` into a plain function returning a
/// boxed future, which is the shape `Scripts::register` accepts.
///
/// ```rust,ignore
/// #[iteration]
/// async fn ping(vu: &mut Vu) -> IterationResult {
///     vu.get("/ping").await;
///     Ok(())
/// }
/// ```
#[proc_macro_attribute]
pub fn iteration(_attr: TokenStream, item: TokenStream) -> TokenStream {
    let ItemFn {
        attrs,
        vis,
        mut sig,
        block,
    } = parse_macro_input!(item as ItemFn);

    if sig.asyncness.take().is_none() {
        return syn::Error::new_spanned(sig.fn_token, "#[iteration] expects an `async fn`")
            .to_compile_error()
            .into();
    }

    let output = match &sig.output {
        ReturnType::Default => quote!(()),
        ReturnType::Type(_, ty) => quote!(#ty),
    };
    sig.output = parse_quote!(-> ::volley::BoxFuture<'_, #output>);

    let expanded = quote! {
        #(#attrs)*
        #vis #sig {
            ::std::boxed::Box::pin(async move #block)
        }
    };

    TokenStream::from(expanded)
}
