use proc_macro::TokenStream;
use quote::quote;
use syn::{
    parse,
    parse_macro_input,
    DeriveInput,
};

#[proc_macro_derive(RegisterSerde)]
/// Derived on a packed_struct to shim in our serde methods on packed structs.
/// Expects `Serialize`, `Deserialize` and `PackedStruct` to be in scope.
pub fn derive_register_serde(tokens: TokenStream) -> TokenStream {
    let input = parse_macro_input!(tokens as DeriveInput);
    let name = input.ident;
    let (impl_generics, ty_generics, where_clause) = input.generics.split_for_impl();
    let generated = quote! {
        impl #impl_generics Serialize for #name #ty_generics #where_clause {
            type Chunk = <Self as PackedStruct>::ByteArray;

            fn serialize(&self) -> ::packed_struct::PackingResult<Self::Chunk> {
                self.pack()
            }
        }

        impl #impl_generics Deserialize for #name #ty_generics #where_clause {
            type Chunk = <Self as PackedStruct>::ByteArray;

            fn deserialize(chunk: Self::Chunk) -> ::packed_struct::PackingResult<Self> {
                Self::unpack(&chunk)
            }
        }
    };
    TokenStream::from(generated)
}

#[proc_macro_attribute]
/// Attaches a device register address to a register struct by implementing `Address`
pub fn address(attr: TokenStream, item: TokenStream) -> TokenStream {
    let num = match parse::<syn::Lit>(attr) {
        Ok(syn::Lit::Int(v)) => v,
        Ok(other) => {
            return syn::Error::new(other.span(), "The address must be a literal integer")
                .to_compile_error()
                .into()
        }
        Err(e) => return e.to_compile_error().into(),
    };
    let item = parse_macro_input!(item as DeriveInput);
    let ident = &item.ident;

    let generated = quote! {
        #item

        impl Address for #ident {
            fn addr() -> u16 {
                #num as u16
            }
        }
    };
    TokenStream::from(generated)
}
