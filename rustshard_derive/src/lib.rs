use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::quote;
use syn::{Data, DeriveInput, Fields, LitStr, parse_macro_input, spanned::Spanned};

/// Implements `rustshard::orm::Entity` for a struct with named fields.
///
/// Struct options: `#[entity(table = "...", replace, ignore)]`.
/// Field options: `#[entity(skip)]`, `#[entity(column = "...")]`.
/// Every mapped field type must implement `rustshard::orm::FieldValue`,
/// and one field must map to the `id` column.
#[proc_macro_derive(Entity, attributes(entity))]
pub fn derive_entity(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);
    match expand_entity(input) {
        Ok(tokens) => tokens.into(),
        Err(err) => err.to_compile_error().into(),
    }
}

/// Implements `rustshard::orm::FieldValue` for a fieldless enum, stored by
/// variant name. `#[entity(rename = "...")]` overrides a stored name.
#[proc_macro_derive(EntityEnum, attributes(entity))]
pub fn derive_entity_enum(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);
    match expand_entity_enum(input) {
        Ok(tokens) => tokens.into(),
        Err(err) => err.to_compile_error().into(),
    }
}

#[derive(Default)]
struct EntityOptions {
    table_name: Option<String>,
    replace_supported: bool,
    ignore_supported: bool,
}

#[derive(Default)]
struct FieldOptions {
    skip: bool,
    column: Option<String>,
}

fn expand_entity(input: DeriveInput) -> syn::Result<TokenStream2> {
    let struct_name = input.ident;

    if !input.generics.params.is_empty() {
        return Err(syn::Error::new_spanned(
            input.generics,
            "Entity does not support generic structs",
        ));
    }

    let options = parse_entity_options(&input.attrs)?;

    let data_struct = match input.data {
        Data::Struct(data) => data,
        _ => {
            return Err(syn::Error::new(
                struct_name.span(),
                "Entity can only be derived for structs",
            ));
        }
    };

    let named_fields = match data_struct.fields {
        Fields::Named(fields) => fields,
        _ => {
            return Err(syn::Error::new(
                struct_name.span(),
                "Entity requires named fields",
            ));
        }
    };

    let mut descriptors = Vec::<TokenStream2>::new();
    let mut read_arms = Vec::<TokenStream2>::new();
    let mut write_arms = Vec::<TokenStream2>::new();
    let mut has_id = false;

    for field in named_fields.named {
        let field_options = parse_field_options(&field.attrs)?;
        if field_options.skip {
            continue;
        }

        let ident = field
            .ident
            .clone()
            .ok_or_else(|| syn::Error::new(field.span(), "Entity requires named fields"))?;
        let ty = field.ty;
        let column = field_options
            .column
            .unwrap_or_else(|| ident.to_string().trim_start_matches("r#").to_string());
        has_id |= column == "id";

        let index = descriptors.len();
        descriptors.push(quote! {
            ::rustshard::orm::FieldDescriptor::new(
                #column,
                <#ty as ::rustshard::orm::FieldValue>::KIND,
                <#ty as ::rustshard::orm::FieldValue>::NULLABLE,
            )
        });
        read_arms.push(quote! {
            #index => ::rustshard::orm::FieldValue::to_value(&self.#ident),
        });
        write_arms.push(quote! {
            #index => {
                self.#ident = <#ty as ::rustshard::orm::FieldValue>::from_value(value)?;
                ::std::result::Result::Ok(())
            }
        });
    }

    if !has_id {
        return Err(syn::Error::new(
            struct_name.span(),
            "Entity requires a field mapped to the `id` column",
        ));
    }

    let type_name = struct_name.to_string();
    let table = match options.table_name {
        Some(table) => quote! { ::std::option::Option::Some(#table) },
        None => quote! { ::std::option::Option::None },
    };
    let replace_supported = options.replace_supported;
    let ignore_supported = options.ignore_supported;

    Ok(quote! {
        impl ::rustshard::orm::Entity for #struct_name {
            fn entity_descriptor() -> ::rustshard::orm::EntityDescriptor {
                ::rustshard::orm::EntityDescriptor {
                    type_name: #type_name,
                    table: #table,
                    replace_supported: #replace_supported,
                    ignore_supported: #ignore_supported,
                    fields: ::std::vec![#(#descriptors),*],
                }
            }

            fn read_field(&self, index: usize) -> ::rustshard::Value {
                match index {
                    #(#read_arms)*
                    _ => ::rustshard::Value::Null,
                }
            }

            fn write_field(
                &mut self,
                index: usize,
                value: ::rustshard::Value,
            ) -> ::rustshard::Result<()> {
                match index {
                    #(#write_arms)*
                    _ => ::std::result::Result::Err(::rustshard::DbError::MappingError(
                        ::std::format!("{} has no field #{}", #type_name, index),
                    )),
                }
            }
        }
    })
}

fn expand_entity_enum(input: DeriveInput) -> syn::Result<TokenStream2> {
    let enum_name = input.ident;

    if !input.generics.params.is_empty() {
        return Err(syn::Error::new_spanned(
            input.generics,
            "EntityEnum does not support generic enums",
        ));
    }

    let data_enum = match input.data {
        Data::Enum(data) => data,
        _ => {
            return Err(syn::Error::new(
                enum_name.span(),
                "EntityEnum can only be derived for enums",
            ));
        }
    };

    if data_enum.variants.is_empty() {
        return Err(syn::Error::new(
            enum_name.span(),
            "EntityEnum requires at least one variant",
        ));
    }

    let mut to_arms = Vec::<TokenStream2>::new();
    let mut from_arms = Vec::<TokenStream2>::new();
    for variant in &data_enum.variants {
        if !matches!(variant.fields, Fields::Unit) {
            return Err(syn::Error::new(
                variant.span(),
                "EntityEnum variants cannot carry data",
            ));
        }
        let ident = &variant.ident;
        let stored = parse_variant_rename(&variant.attrs)?.unwrap_or_else(|| ident.to_string());
        to_arms.push(quote! { Self::#ident => #stored, });
        from_arms.push(quote! { #stored => ::std::result::Result::Ok(Self::#ident), });
    }

    let type_name = enum_name.to_string();

    Ok(quote! {
        impl ::rustshard::orm::FieldValue for #enum_name {
            const KIND: ::rustshard::orm::FieldKind = ::rustshard::orm::FieldKind::Enum;

            fn to_value(&self) -> ::rustshard::Value {
                let name: &str = match self {
                    #(#to_arms)*
                };
                ::rustshard::Value::Text(name.to_string())
            }

            fn from_value(value: ::rustshard::Value) -> ::rustshard::Result<Self> {
                match value {
                    ::rustshard::Value::Text(text) => match text.as_str() {
                        #(#from_arms)*
                        other => ::std::result::Result::Err(::rustshard::DbError::MappingError(
                            ::std::format!("unknown {} variant '{}'", #type_name, other),
                        )),
                    },
                    ::rustshard::Value::Null => ::std::result::Result::Err(
                        ::rustshard::DbError::MappingError(::std::format!(
                            "cannot store NULL into non-nullable {}",
                            #type_name
                        )),
                    ),
                    other => ::std::result::Result::Err(::rustshard::DbError::MappingError(
                        ::std::format!("expected {} variant name, got {}", #type_name, other),
                    )),
                }
            }
        }
    })
}

fn parse_entity_options(attrs: &[syn::Attribute]) -> syn::Result<EntityOptions> {
    let mut options = EntityOptions::default();

    for attr in attrs {
        if !attr.path().is_ident("entity") {
            continue;
        }

        attr.parse_nested_meta(|meta| {
            if meta.path.is_ident("table") {
                let value = meta.value()?;
                let lit: LitStr = value.parse()?;
                options.table_name = Some(lit.value());
                return Ok(());
            }

            if meta.path.is_ident("replace") {
                options.replace_supported = true;
                return Ok(());
            }

            if meta.path.is_ident("ignore") {
                options.ignore_supported = true;
                return Ok(());
            }

            Err(meta.error(
                "Unsupported #[entity(...)] option. Supported: table = \"...\", replace, ignore",
            ))
        })?;
    }

    Ok(options)
}

fn parse_field_options(attrs: &[syn::Attribute]) -> syn::Result<FieldOptions> {
    let mut options = FieldOptions::default();

    for attr in attrs {
        if !attr.path().is_ident("entity") {
            continue;
        }

        attr.parse_nested_meta(|meta| {
            if meta.path.is_ident("skip") {
                options.skip = true;
                return Ok(());
            }

            if meta.path.is_ident("column") {
                let value = meta.value()?;
                let lit: LitStr = value.parse()?;
                options.column = Some(lit.value());
                return Ok(());
            }

            Err(meta.error(
                "Unsupported #[entity(...)] field option. Supported: skip, column = \"...\"",
            ))
        })?;
    }

    Ok(options)
}

fn parse_variant_rename(attrs: &[syn::Attribute]) -> syn::Result<Option<String>> {
    let mut rename = None;

    for attr in attrs {
        if !attr.path().is_ident("entity") {
            continue;
        }

        attr.parse_nested_meta(|meta| {
            if meta.path.is_ident("rename") {
                let value = meta.value()?;
                let lit: LitStr = value.parse()?;
                rename = Some(lit.value());
                return Ok(());
            }

            Err(meta.error("Unsupported #[entity(...)] variant option. Supported: rename = \"...\""))
        })?;
    }

    Ok(rename)
}
