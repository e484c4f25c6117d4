use std::collections::HashSet;
use syn::punctuated::Punctuated;
use syn::{Attribute, Path, Token};

/// 把事件类型必需的 derive 与用户已写的 derive 合并为首个属性。
///
/// 按路径末段去重（`Serialize` 与 `serde::Serialize` 视为同一项），必需项在前；
/// 无法解析的 `#[derive(..)]` 原样保留，交给编译器报错。
pub(crate) fn apply_derives(attrs: &mut Vec<Attribute>, required: Vec<Path>) {
    let mut user_derives = Vec::new();
    let mut others = Vec::with_capacity(attrs.len());

    for attr in attrs.drain(..) {
        let parsed = attr
            .path()
            .is_ident("derive")
            .then(|| attr.parse_args_with(Punctuated::<Path, Token![,]>::parse_terminated).ok())
            .flatten();
        match parsed {
            Some(paths) => user_derives.extend(paths),
            None => others.push(attr),
        }
    }

    let mut seen = HashSet::new();
    let derives: Vec<Path> = required
        .into_iter()
        .chain(user_derives)
        .filter(|p| seen.insert(p.segments.last().map(|s| s.ident.to_string())))
        .collect();

    attrs.push(syn::parse_quote!(#[derive(#(#derives),*)]));
    attrs.extend(others);
}
