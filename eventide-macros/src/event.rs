use crate::utils::apply_derives;
use proc_macro::TokenStream;
use quote::quote;
use syn::spanned::Spanned;
use syn::{Item, LitStr, Result, Token, parse::Parse, parse::ParseStream, parse_macro_input};

/// #[event] 宏实现
pub(crate) fn expand(attr: TokenStream, item: TokenStream) -> TokenStream {
    let cfg = parse_macro_input!(attr as EventAttrConfig);
    let mut input = parse_macro_input!(item as Item);

    let required: Vec<syn::Path> = vec![
        syn::parse_quote!(Debug),
        syn::parse_quote!(Clone),
        syn::parse_quote!(serde::Serialize),
        syn::parse_quote!(serde::Deserialize),
    ];

    let (ident, generics) = match &mut input {
        Item::Struct(st) => {
            apply_derives(&mut st.attrs, required);
            (st.ident.clone(), st.generics.clone())
        }
        Item::Enum(en) => {
            apply_derives(&mut en.attrs, required);
            (en.ident.clone(), en.generics.clone())
        }
        other => {
            return syn::Error::new(other.span(), "#[event] only supports struct or enum")
                .to_compile_error()
                .into();
        }
    };

    let name = cfg
        .name
        .unwrap_or_else(|| LitStr::new(&ident.to_string(), ident.span()));
    let (impl_generics, ty_generics, where_clause) = generics.split_for_impl();

    TokenStream::from(quote! {
        #input

        impl #impl_generics ::eventide_core::Event for #ident #ty_generics #where_clause {
            const NAME: &'static str = #name;
        }
    })
}

// -------- parsing --------

struct EventAttrConfig {
    name: Option<LitStr>,
}

impl Parse for EventAttrConfig {
    fn parse(input: ParseStream) -> Result<Self> {
        let mut name: Option<LitStr> = None;
        if input.is_empty() {
            return Ok(Self { name });
        }

        let pairs: syn::punctuated::Punctuated<EventAttrElem, Token![,]> =
            syn::punctuated::Punctuated::parse_terminated(input)?;

        for elem in pairs {
            match elem {
                EventAttrElem::Name(lit) => {
                    if name.is_some() {
                        return Err(syn::Error::new(lit.span(), "duplicate key 'name' in attribute"));
                    }
                    if lit.value().trim().is_empty() {
                        return Err(syn::Error::new(lit.span(), "event name must not be empty"));
                    }
                    name = Some(lit);
                }
            }
        }
        Ok(Self { name })
    }
}

enum EventAttrElem {
    Name(LitStr),
}

impl Parse for EventAttrElem {
    fn parse(input: ParseStream) -> Result<Self> {
        let key: syn::Ident = input.parse()?;
        if key == "name" {
            let _eq: Token![=] = input.parse()?;
            Ok(Self::Name(input.parse()?))
        } else {
            Err(syn::Error::new(
                key.span(),
                "unknown key in attribute; expected 'name'",
            ))
        }
    }
}
