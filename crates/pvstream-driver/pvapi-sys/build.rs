use std::env;
use std::path::PathBuf;

fn main() {
    // Bindgen and linking only run with the `pvapi-sdk` feature so the crate
    // builds on machines without the GigE SDK.
    #[cfg(feature = "pvapi-sdk")]
    {
        println!("cargo:rerun-if-env-changed=PVAPI_SDK_DIR");
        println!("cargo:rerun-if-env-changed=PVAPI_LIB_DIR");
        println!("cargo:rerun-if-changed=wrapper.h");

        let sdk_dir = env::var("PVAPI_SDK_DIR").expect(
            "PVAPI_SDK_DIR environment variable must be set when `pvapi-sdk` feature is enabled.",
        );

        let sdk_include_path = PathBuf::from(&sdk_dir).join("inc-pc");

        // The SDK ships one lib directory per target; PVAPI_LIB_DIR picks it explicitly.
        let sdk_lib_path = if let Ok(lib_dir) = env::var("PVAPI_LIB_DIR") {
            PathBuf::from(lib_dir)
        } else {
            PathBuf::from(&sdk_dir).join("lib-pc")
        };

        if !sdk_include_path.exists() {
            panic!(
                "PvAPI SDK include path does not exist: {:?}",
                sdk_include_path
            );
        }
        if !sdk_lib_path.exists() {
            eprintln!(
                "Warning: PvAPI SDK lib path does not exist: {:?}",
                sdk_lib_path
            );
        }

        // PvApi.h selects its platform typedefs from these defines.
        let mut platform_args = Vec::new();
        if cfg!(target_os = "linux") {
            platform_args.push("-D_LINUX");
        } else if cfg!(target_os = "macos") {
            platform_args.push("-D_OSX");
        } else if cfg!(target_os = "windows") {
            platform_args.push("-D_WINDOWS");
        }
        if cfg!(target_pointer_width = "64") {
            platform_args.push("-D_x64");
        } else {
            platform_args.push("-D_x86");
        }

        let bindings = bindgen::Builder::default()
            .header("wrapper.h")
            .parse_callbacks(Box::new(bindgen::CargoCallbacks::new()))
            .clang_arg(format!("-I{}", sdk_include_path.display()))
            .clang_args(platform_args)
            // Entry points all start with `Pv`, types with `tPv`, enum values with `ePv`.
            .allowlist_function("Pv.*")
            .allowlist_type("tPv.*")
            .allowlist_var("ePv.*")
            // Status and format codes are compared numerically against their SDK values.
            .default_enum_style(bindgen::EnumVariation::Consts)
            .prepend_enum_name(false)
            .derive_default(true)
            .generate()
            .expect("Unable to generate bindings");

        let out_path = PathBuf::from(env::var("OUT_DIR").unwrap());
        bindings
            .write_to_file(out_path.join("bindings.rs"))
            .expect("Couldn't write bindings!");

        println!("cargo:rustc-link-search=native={}", sdk_lib_path.display());
        println!("cargo:rustc-link-lib=PvAPI");
    }
    #[cfg(not(feature = "pvapi-sdk"))]
    {
        // Without the SDK, write an empty bindings file so src/lib.rs still compiles.
        let out_path = PathBuf::from(env::var("OUT_DIR").unwrap());
        std::fs::write(
            out_path.join("bindings.rs"),
            "// Dummy bindings when pvapi-sdk feature is not enabled\n",
        )
        .expect("Couldn't write dummy bindings!");
    }
}
